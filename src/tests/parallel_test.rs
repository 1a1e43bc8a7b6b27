use test_env_log::test;

use crate::riverpool::pg::protocol::Tag;
use crate::tests::common::*;

fn parallel_config(n: usize) -> std::sync::Arc<crate::riverpool::config::ConfigHandle> {
    config(n, |c| {
        c.parallel_mode = true;
        c.replication_mode = false;
    })
}

#[test(tokio::test)]
async fn test_parallel_select() {
    let responders = vec![responder(|_| select_reply("a")), responder(|_| select_reply("b"))];
    let s = session(parallel_config(2), responders);
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_query(&mut client, "SELECT v FROM t").await;
    let messages = read_until_ready(&mut client).await;
    assert_eq!(tags(&messages), "TDCZ");
    // only the first node to answer reaches the client
    assert!(messages[1] == data_row(&["a"]) || messages[1] == data_row(&["b"]));
    assert_eq!(messages[2].first_str().unwrap(), "SELECT 1");

    send_terminate(&mut client).await;
    let (mut dispatcher, _) = run.await.unwrap();
    let logs = finish(&mut dispatcher, s.backends).await;
    for log in logs {
        assert_eq!(log, vec!["SELECT v FROM t"]);
    }
}

#[test(tokio::test)]
async fn test_parallel_error_forwarded_once() {
    let s = session(parallel_config(2), same_reply(2, |_| vec![error_response("42703", "column \"v\" does not exist")]));
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_query(&mut client, "SELECT v FROM t").await;
    let messages = read_until_ready(&mut client).await;
    assert_eq!(tags(&messages), "EZ");
    assert_eq!(error_code(&messages[0]), "42703");
    assert_eq!(messages[1].body(), b"I");

    send_terminate(&mut client).await;
    let (mut dispatcher, _) = run.await.unwrap();
    finish(&mut dispatcher, s.backends).await;
}

#[test(tokio::test)]
async fn test_parallel_drop_database() {
    let s = session(parallel_config(2), same_reply(2, |_| vec![command_complete("DROP DATABASE")]));
    let status = s.status.clone();
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_query(&mut client, "DROP DATABASE scratch").await;
    let messages = read_until_ready(&mut client).await;
    assert_eq!(tags(&messages), "CZ");
    assert_eq!(messages[0].tag(), Tag::COMMAND_COMPLETE);
    assert_eq!(status.close_idle_requests(), 1);

    send_terminate(&mut client).await;
    let (mut dispatcher, _) = run.await.unwrap();
    finish(&mut dispatcher, s.backends).await;
}
