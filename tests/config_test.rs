use std::env;
use std::io::Write;
use std::path::PathBuf;

use serial_test::serial;

use riverpool::config::{load_config_file, parse_config, ConfigHandle};

const CONFIG: &str = r#"
port: ${RIVERPOOL_TEST_PORT:9999}
replication_mode: true
load_balance_mode: true
backends:
  - host: ${RIVERPOOL_TEST_HOST}
    port: 5432
  - host: db2
    weight: 0.5
"#;

#[test]
#[serial]
fn test_env_var_substitution() {
    env::set_var("RIVERPOOL_TEST_HOST", "db1");
    env::remove_var("RIVERPOOL_TEST_PORT");
    let settings = parse_config(CONFIG, PathBuf::from("riverpool.yaml")).unwrap();
    assert_eq!(settings.port, 9999);
    assert_eq!(settings.backends[0].host, "db1");
    assert_eq!(settings.weights(), vec![1.0, 0.5]);
    assert!(settings.load_balance_mode);

    env::set_var("RIVERPOOL_TEST_PORT", "6432");
    let settings = parse_config(CONFIG, PathBuf::from("riverpool.yaml")).unwrap();
    assert_eq!(settings.port, 6432);
    env::remove_var("RIVERPOOL_TEST_PORT");
}

#[test]
#[serial]
fn test_missing_env_var() {
    env::remove_var("RIVERPOOL_TEST_HOST");
    let err = parse_config(CONFIG, PathBuf::from("riverpool.yaml")).unwrap_err();
    assert!(err.to_string().contains("RIVERPOOL_TEST_HOST"));
}

#[test]
#[serial]
fn test_reload_from_file() {
    env::set_var("RIVERPOOL_TEST_HOST", "db1");
    let path = env::temp_dir().join(format!("riverpool_config_test_{}.yaml", std::process::id()));
    std::fs::write(&path, CONFIG).unwrap();
    let handle = ConfigHandle::new(load_config_file(path.clone()).unwrap());
    assert!(!handle.get().log_statement);

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "log_statement: true").unwrap();
    drop(file);
    handle.reload().unwrap();
    assert_eq!(handle.generation(), 1);
    assert!(handle.get().log_statement);

    // a reload that changes the number of backends is refused
    std::fs::write(&path, "backends:\n  - host: db1\n").unwrap();
    assert!(handle.reload().is_err());
    assert_eq!(handle.generation(), 1);
    assert_eq!(handle.get().num_backends(), 2);
    std::fs::remove_file(&path).unwrap();
}
