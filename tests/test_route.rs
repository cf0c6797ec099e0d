use std::path::PathBuf;

use portico::config::Config;
use portico::http::request::Method;
use portico::http::response::StatusCode;
use portico::route::{parse_size, EffectiveConfig, Resolve, VirtualHosts};

fn hosts(yaml: &str) -> VirtualHosts {
    let cfg = Config::from_yaml_str(yaml).unwrap();
    VirtualHosts::new(&cfg.servers).unwrap()
}

fn root_for(hosts: &VirtualHosts, host: Option<&str>) -> String {
    hosts
        .resolve(host, "/")
        .first("root")
        .unwrap_or("")
        .to_string()
}

const NAMED: &str = "\
servers:
  - listen: 8080
    server_name: default.test
    root: /srv/default
  - listen: 8080
    server_name: [www.example.com, '*.example.com']
    root: /srv/exact
  - listen: 8080
    server_name: '*.shop.example.com'
    root: /srv/shop
  - listen: 8080
    server_name: 'mail.*'
    root: /srv/mail
  - listen: 8080
    server_name: '~^api[0-9]+\\.test$'
    root: /srv/api
";

#[test]
fn test_server_name_precedence() {
    let hosts = hosts(NAMED);

    assert_eq!(root_for(&hosts, Some("www.example.com")), "/srv/exact");
    assert_eq!(root_for(&hosts, Some("WWW.Example.com:8080")), "/srv/exact");
    // Longest leading wildcard wins.
    assert_eq!(root_for(&hosts, Some("cart.shop.example.com")), "/srv/shop");
    assert_eq!(root_for(&hosts, Some("blog.example.com")), "/srv/exact");
    assert_eq!(root_for(&hosts, Some("mail.example.org")), "/srv/mail");
    assert_eq!(root_for(&hosts, Some("api42.test")), "/srv/api");
}

#[test]
fn test_unknown_host_uses_first_server() {
    let hosts = hosts(NAMED);

    assert_eq!(root_for(&hosts, Some("unknown.org")), "/srv/default");
    assert_eq!(root_for(&hosts, None), "/srv/default");
    assert_eq!(root_for(&hosts, Some("[::1]:8080")), "/srv/default");
}

const LOCATED: &str = "\
servers:
  - listen: 8080
    root: /srv/www
    locations:
      /:
        autoindex: on
      = /exact:
        return: 200 exact
      /images/:
        root: /srv/prefix
      ^~ /static/:
        root: /srv/static
      ~* \\.(png|jpg)$:
        root: /srv/regex
      /images/icons/:
        root: /srv/icons
";

#[test]
fn test_location_precedence() {
    let hosts = hosts(LOCATED);
    let root = |path: &str| hosts.resolve(None, path).root();

    assert_eq!(
        hosts.resolve(None, "/exact").redirect(),
        Some((StatusCode::OK, "exact".to_string()))
    );
    // A regex beats a plain prefix...
    assert_eq!(root("/images/logo.PNG"), PathBuf::from("/srv/regex"));
    // ...but not a `^~` prefix.
    assert_eq!(root("/static/logo.png"), PathBuf::from("/srv/static"));
    assert_eq!(root("/images/icons/a.svg"), PathBuf::from("/srv/icons"));
    assert_eq!(root("/images/a.svg"), PathBuf::from("/srv/prefix"));
    assert_eq!(root("/other"), PathBuf::from("/srv/www"));
}

#[test]
fn test_location_directives_override_server() {
    let hosts = hosts(LOCATED);

    let config = hosts.resolve(None, "/images/a.svg");
    assert_eq!(config.location.as_deref(), Some("/images/"));
    assert!(!config.autoindex());

    let config = hosts.resolve(None, "/readme");
    assert_eq!(config.location.as_deref(), Some("/"));
    assert!(config.autoindex());
}

#[test]
fn test_invalid_patterns_are_rejected() {
    let cfg = Config::from_yaml_str("servers:\n  - listen: 80\n    server_name: '~(['\n").unwrap();
    assert!(VirtualHosts::new(&cfg.servers).is_err());

    let cfg = Config::from_yaml_str("servers:\n  - listen: 80\n    locations:\n      '~ (':\n").unwrap();
    assert!(VirtualHosts::new(&cfg.servers).is_err());
}

fn effective(pairs: &[(&str, &[&str])]) -> EffectiveConfig {
    let mut config = EffectiveConfig::default();
    for (name, values) in pairs {
        config
            .directives
            .insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
    }
    config
}

#[test]
fn test_effective_config_defaults() {
    let config = EffectiveConfig::default();

    assert_eq!(config.root(), PathBuf::from("public"));
    assert_eq!(config.index(), vec!["index.html".to_string()]);
    assert!(!config.autoindex());
    assert!(config.allows(Method::GET));
    assert!(config.allows(Method::DELETE));
    assert!(!config.allows(Method::PUT));
    assert!(config.cgi_extensions().is_empty());
    assert_eq!(config.client_max_body_size(), None);
    assert_eq!(config.redirect(), None);
    assert_eq!(config.upload_path(), None);
}

#[test]
fn test_effective_config_accessors() {
    let config = effective(&[
        ("root", &["/srv/site"]),
        ("allow_methods", &["get", "head"]),
        ("client_max_body_size", &["8k"]),
        ("error_page", &["404 410 /errors/gone.html", "500 /errors/oops.html"]),
        ("return", &["301", "https://example.com/"]),
        ("upload_path", &["/srv/uploads"]),
    ]);

    assert!(config.allows(Method::HEAD));
    assert!(!config.allows(Method::POST));
    assert_eq!(config.client_max_body_size(), Some(8 * 1024));
    assert_eq!(
        config.error_page(StatusCode::NOT_FOUND),
        Some(PathBuf::from("/srv/site/errors/gone.html"))
    );
    assert_eq!(
        config.error_page(StatusCode::INTERNAL_SERVER_ERROR),
        Some(PathBuf::from("/srv/site/errors/oops.html"))
    );
    assert_eq!(config.error_page(StatusCode::FORBIDDEN), None);
    assert_eq!(
        config.redirect(),
        Some((StatusCode::MOVED_PERMANENTLY, "https://example.com/".to_string()))
    );
    assert_eq!(config.upload_path(), Some(PathBuf::from("/srv/uploads")));
}

#[test]
fn test_parse_size_suffixes() {
    assert_eq!(parse_size("1024"), Some(1024));
    assert_eq!(parse_size("8K"), Some(8 * 1024));
    assert_eq!(parse_size("1m"), Some(1024 * 1024));
    assert_eq!(parse_size("2G"), Some(2 * 1024 * 1024 * 1024));
    assert_eq!(parse_size("big"), None);
    assert_eq!(parse_size(""), None);
}
