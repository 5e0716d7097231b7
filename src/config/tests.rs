use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(8080);
    raw.logging.level = Some("info".to_string());
    raw.origin.host = Some("minio.internal".to_string());

    let overrides = ServeOverrides {
        port: Some(4321),
        log_level: Some("debug".to_string()),
        origin_host: Some("storage.internal".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.origin.host, "storage.internal");
}

#[test]
fn defaults_describe_a_local_origin() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.origin.scheme, "http");
    assert_eq!(settings.origin.host, "127.0.0.1");
    assert_eq!(settings.origin.port, 9000);
    assert_eq!(settings.origin.first_byte_timeout, Duration::from_secs(30));
    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
    assert_eq!(
        settings.server.max_request_body_bytes.get() as u64,
        DEFAULT_MAX_REQUEST_BODY_BYTES
    );
    assert_eq!(settings.cache.eviction, EvictionPolicy::Lru);
    assert_eq!(settings.cache.default_ttl, Duration::from_secs(120));
    assert_eq!(settings.policy.status_header, HeaderName::from_static("x-cache"));
    assert!(settings.policy.pass_authorized);
    assert_eq!(settings.policy.bypass_prefixes, vec!["/upload", "/api/"]);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_overrides_apply() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        cache_max_entries: Some(64),
        cache_eviction: Some("FIFO".to_string()),
        cache_default_ttl_seconds: Some(0),
        cache_default_grace_seconds: Some(3),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.max_entries.get(), 64);
    assert_eq!(settings.cache.eviction, EvictionPolicy::Fifo);
    assert_eq!(settings.cache.default_ttl, Duration::ZERO);
    assert_eq!(settings.cache.default_grace, Duration::from_secs(3));
}

#[test]
fn unknown_eviction_policy_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.eviction = Some("random".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid eviction");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.eviction",
            ..
        }
    ));
}

#[test]
fn origin_scheme_must_be_http_or_https() {
    let mut raw = RawSettings::default();
    raw.origin.scheme = Some("ftp".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid scheme");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "origin.scheme",
            ..
        }
    ));
}

#[test]
fn zero_timeouts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.origin.between_bytes_timeout_seconds = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero timeout");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "origin.between_bytes_timeout_seconds",
            ..
        }
    ));
}

#[test]
fn object_limit_cannot_exceed_total_budget() {
    let mut raw = RawSettings::default();
    raw.cache.max_total_bytes = Some(1024);
    raw.cache.max_object_bytes = Some(2048);

    let err = Settings::from_raw(raw).expect_err("object limit too large");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.max_object_bytes",
            ..
        }
    ));
}

#[test]
fn admin_listener_must_differ_from_proxy() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(7000);
    raw.server.admin_port = Some(7000);

    let err = Settings::from_raw(raw).expect_err("shared address");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "server.admin_port",
            ..
        }
    ));
}

#[test]
fn policy_lists_are_normalised() {
    let mut raw = RawSettings::default();
    raw.policy.static_extensions = Some(vec![".PNG".to_string(), " svg ".to_string()]);
    raw.policy.diagnostic_headers = Some(vec!["Via".to_string()]);
    raw.policy.status_header = Some("X-Cache-Status".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.policy.static_extensions, vec!["png", "svg"]);
    assert_eq!(
        settings.policy.diagnostic_headers,
        vec![HeaderName::from_static("via")]
    );
    assert_eq!(settings.policy.status_header.as_str(), "x-cache-status");
}

#[test]
fn bypass_prefix_must_be_absolute() {
    let mut raw = RawSettings::default();
    raw.policy.bypass_prefixes = Some(vec!["upload".to_string()]);

    let err = Settings::from_raw(raw).expect_err("relative prefix");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "policy.bypass_prefixes",
            ..
        }
    ));
}

#[test]
fn status_header_cannot_be_stripped() {
    let mut raw = RawSettings::default();
    raw.policy.diagnostic_headers = Some(vec!["x-cache".to_string()]);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["cachet"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_arguments() {
    let args = CliArgs::parse_from([
        "cachet",
        "serve",
        "--origin-host",
        "minio",
        "--origin-port",
        "9001",
        "--cache-eviction",
        "fifo",
        "--log-json",
        "yes",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.origin_host.as_deref(), Some("minio"));
            assert_eq!(serve.overrides.origin_port, Some(9001));
            assert_eq!(serve.overrides.cache_eviction.as_deref(), Some("fifo"));
            assert_eq!(serve.overrides.log_json, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_check_config_arguments() {
    let args = CliArgs::parse_from([
        "cachet",
        "--config-file",
        "/etc/cachet.toml",
        "check-config",
        "--server-port",
        "8081",
    ]);

    assert_eq!(
        args.config_file.as_deref(),
        Some(std::path::Path::new("/etc/cachet.toml"))
    );
    match args.command.expect("check-config command") {
        Command::CheckConfig(check) => assert_eq!(check.overrides.port, Some(8081)),
        _ => panic!("wrong command parsed"),
    }
}
