use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use portico::config::{parse_listen, Config, CONFIG_ENV};
use portico::event::BackendKind;

#[test]
fn test_config_defaults() {
    let cfg = Config::from_yaml_str("servers:\n  - listen: 8080\n").unwrap();

    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.event_backend, BackendKind::Auto);
    assert_eq!(cfg.timeouts.client_idle(), Duration::from_secs(15));
    assert_eq!(cfg.timeouts.cgi(), Duration::from_secs(10));
    assert_eq!(cfg.timeouts.poll_interval(), Duration::from_millis(1000));
    assert_eq!(cfg.servers.len(), 1);
    assert_eq!(cfg.servers[0].listen, vec!["0.0.0.0:8080".parse::<SocketAddr>().unwrap()]);
    assert!(cfg.servers[0].server_name.is_empty());
    assert!(cfg.servers[0].locations.is_empty());
}

#[test]
fn test_config_top_level_settings() {
    let yaml = "\
log_level: debug
event_backend: poll
timeouts:
  cgi_secs: 3
servers:
  - listen: 127.0.0.1:9000
";
    let cfg = Config::from_yaml_str(yaml).unwrap();
    assert_eq!(cfg.log_level, "debug");
    assert_eq!(cfg.event_backend, BackendKind::Poll);
    assert_eq!(cfg.timeouts.cgi(), Duration::from_secs(3));
    // Unset timeouts keep their defaults.
    assert_eq!(cfg.timeouts.client_idle_secs, 15);
}

#[test]
fn test_config_scalars_become_lists() {
    let yaml = "\
servers:
  - listen: [8080, 127.0.0.1:8081]
    server_name: Example.COM
    index: [index.html, index.htm]
    autoindex: true
    client_max_body_size: 1M
";
    let cfg = Config::from_yaml_str(yaml).unwrap();
    let server = &cfg.servers[0];

    assert_eq!(server.listen.len(), 2);
    assert_eq!(server.server_name, vec!["example.com".to_string()]);
    assert_eq!(server.directives["index"], vec!["index.html", "index.htm"]);
    assert_eq!(server.directives["autoindex"], vec!["on"]);
    assert_eq!(server.directives["client_max_body_size"], vec!["1M"]);
}

#[test]
fn test_config_locations_keep_declaration_order() {
    let yaml = "\
servers:
  - listen: 8080
    locations:
      /zeta:
        root: /srv/z
      \"~ \\\\.php$\":
        cgi_extensions: .php
      /alpha:
";
    let cfg = Config::from_yaml_str(yaml).unwrap();
    let patterns: Vec<&str> = cfg.servers[0]
        .locations
        .iter()
        .map(|l| l.pattern.as_str())
        .collect();

    assert_eq!(patterns, vec!["/zeta", "~ \\.php$", "/alpha"]);
    assert_eq!(cfg.servers[0].locations[0].directives["root"], vec!["/srv/z"]);
    assert!(cfg.servers[0].locations[2].directives.is_empty());
}

#[test]
fn test_config_listen_addrs_are_distinct() {
    let yaml = "\
servers:
  - listen: 127.0.0.1:8080
    server_name: a
  - listen: 127.0.0.1:8080
    server_name: b
  - listen: 127.0.0.1:8081
";
    let cfg = Config::from_yaml_str(yaml).unwrap();
    assert_eq!(cfg.listen_addrs().len(), 2);
}

#[test]
fn test_config_rejects_bad_input() {
    assert!(Config::from_yaml_str("servers: []\n").is_err());
    assert!(Config::from_yaml_str("servers:\n  - root: /srv\n").is_err());
    assert!(Config::from_yaml_str("log_level: loud\nservers:\n  - listen: 80\n").is_err());
    assert!(Config::from_yaml_str("event_backend: iocp\nservers:\n  - listen: 80\n").is_err());
    assert!(Config::from_yaml_str("servers:\n  - listen: 80\n    locations:\n      /a: 3\n").is_err());
}

#[test]
fn test_parse_listen_forms() {
    assert_eq!(parse_listen("80").unwrap(), "0.0.0.0:80".parse::<SocketAddr>().unwrap());
    assert_eq!(
        parse_listen(" 10.0.0.1:8443 ").unwrap(),
        "10.0.0.1:8443".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(parse_listen("[::1]:80").unwrap().port(), 80);
    assert!(parse_listen("no-port-here").is_err());
}

#[test]
fn test_config_path_resolution() {
    unsafe {
        std::env::remove_var(CONFIG_ENV);
    }
    assert_eq!(Config::resolve_path(None), PathBuf::from("portico.yaml"));
    assert_eq!(
        Config::resolve_path(Some("site.yaml".to_string())),
        PathBuf::from("site.yaml")
    );

    unsafe {
        std::env::set_var(CONFIG_ENV, "/etc/portico/site.yaml");
    }
    assert_eq!(
        Config::resolve_path(None),
        PathBuf::from("/etc/portico/site.yaml")
    );
    unsafe {
        std::env::remove_var(CONFIG_ENV);
    }
}

#[test]
fn test_config_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("portico.yaml");
    std::fs::write(&path, "servers:\n  - listen: 127.0.0.1:0\n").unwrap();

    let cfg = Config::load(&path).unwrap();
    assert_eq!(cfg.servers[0].listen[0].port(), 0);

    let missing = Config::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(format!("{missing:#}").contains("absent.yaml"));
}
