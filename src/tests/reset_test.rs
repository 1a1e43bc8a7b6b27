use test_env_log::test;

use crate::riverpool::pg::DispatchState;
use crate::tests::common::*;

#[test(tokio::test)]
async fn test_reset_after_terminate() {
    let s = session(config(2, |_| ()), same_reply(2, |_| select_reply("1")));
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_query(&mut client, "SELECT 1").await;
    read_until_ready(&mut client).await;
    send_terminate(&mut client).await;
    let (mut dispatcher, state) = run.await.unwrap();
    assert_eq!(state, DispatchState::Closed);

    assert_eq!(dispatcher.run_reset().await, DispatchState::Idle);
    let logs = finish(&mut dispatcher, s.backends).await;
    for log in logs {
        // no backend was left in a transaction, so ABORT is skipped
        assert!(!log.contains(&"ABORT".to_string()));
        assert_eq!(log.last().map(String::as_str), Some("DISCARD ALL"));
    }
}

#[test(tokio::test)]
async fn test_reset_aborts_and_deallocates() {
    let config = config(2, |c| c.reset_query_list = vec!["ABORT".to_string()]);
    let responders = same_reply(2, |q| {
        if q.starts_with("PREPARE") {
            vec![command_complete("PREPARE")]
        } else {
            select_reply("1")
        }
    });
    let s = session(config, responders);
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_query(&mut client, "BEGIN").await;
    assert_eq!(tags(&read_until_ready(&mut client).await), "CZ");
    send_query(&mut client, "PREPARE p AS SELECT 1").await;
    assert_eq!(tags(&read_until_ready(&mut client).await), "CZ");
    send_terminate(&mut client).await;
    let (mut dispatcher, _) = run.await.unwrap();
    assert_eq!(dispatcher.session().prepared_sql_names(), vec!["p"]);

    assert_eq!(dispatcher.run_reset().await, DispatchState::Idle);
    assert!(dispatcher.session().prepared_sql_names().is_empty());
    let logs = finish(&mut dispatcher, s.backends).await;
    for log in logs {
        assert_eq!(log, vec!["BEGIN", "PREPARE p AS SELECT 1", "ABORT", "DEALLOCATE p"]);
    }
}

#[test(tokio::test)]
async fn test_reset_failure_closes_session() {
    let config = config(2, |c| c.reset_query_list = vec!["RESET ALL".to_string()]);
    let s = session(config, same_reply(2, |_| vec![error_response("25P02", "current transaction is aborted")]));
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_terminate(&mut client).await;
    let (mut dispatcher, state) = run.await.unwrap();
    assert_eq!(state, DispatchState::Closed);

    assert_eq!(dispatcher.run_reset().await, DispatchState::Closed);
    let logs = finish(&mut dispatcher, s.backends).await;
    assert_eq!(logs[0], vec!["RESET ALL"]);
}

#[test(tokio::test)]
async fn test_reset_clears_relcache() {
    let config = config(2, |c| {
        c.load_balance_mode = true;
        c.load_balance_seed = Some(1);
    });
    let s = session(config, same_reply(2, |_| select_reply("1")));
    let mut client = s.client;
    let run = run_dispatcher(s.dispatcher);

    send_query(&mut client, "SELECT * FROM t").await;
    assert_eq!(tags(&read_until_ready(&mut client).await), "TDCZ");
    send_terminate(&mut client).await;
    let (mut dispatcher, state) = run.await.unwrap();
    assert_eq!(state, DispatchState::Closed);
    assert_eq!(dispatcher.relcache.len(), 1);

    assert_eq!(dispatcher.run_reset().await, DispatchState::Idle);
    assert!(dispatcher.relcache.is_empty());
    finish(&mut dispatcher, s.backends).await;
}
