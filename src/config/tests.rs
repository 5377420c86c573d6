use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.database.url = Some("postgres://file".to_string());
    raw.federation.host = Some("file.example".to_string());

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        database_url: Some("postgres://cli".to_string()),
        federation_host: Some("cli.example".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.database.url.as_deref(), Some("postgres://cli"));
    assert_eq!(settings.federation.host, "cli.example");
}

#[test]
fn ephemeral_discards_database_url() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("postgres://file".to_string());
    raw.apply_overrides(&GlobalOverrides {
        ephemeral: true,
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.logging.format, LogFormat::Compact);
    assert_eq!(settings.federation.host, DEFAULT_HOST);
    assert_eq!(settings.federation.account_domain, DEFAULT_HOST);
    assert_eq!(settings.federation.mode, FederationMode::Blocklist);
    assert_eq!(settings.federation.freshness, Duration::from_secs(6 * 60 * 60));
    assert_eq!(settings.federation.forced_freshness, Duration::from_secs(5 * 60));
    assert_eq!(settings.cache.negative_ttl_ms, 30_000);
    assert_eq!(settings.media.public_base, "https://localhost/media");
    assert!(settings.database.url.is_none());
}

#[test]
fn account_domain_defaults_to_normalised_host() {
    let mut raw = RawSettings::default();
    raw.federation.host = Some("Social.Example.".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.federation.host, "social.example");
    assert_eq!(settings.federation.account_domain, "social.example");

    let mut raw = RawSettings::default();
    raw.federation.host = Some("social.example".to_string());
    raw.federation.account_domain = Some("example".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.federation.account_domain, "example");
}

#[test]
fn federation_mode_is_parsed() {
    let mut raw = RawSettings::default();
    raw.federation.mode = Some("allowlist".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.federation.mode, FederationMode::Allowlist);

    let mut raw = RawSettings::default();
    raw.federation.mode = Some("open".to_string());
    let err = Settings::from_raw(raw).expect_err("unknown mode");
    assert!(matches!(err, LoadError::Invalid { key: "federation.mode", .. }));
}

#[test]
fn zero_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.workers.federator_concurrency = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "workers.federator_concurrency",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.federation.freshness_hours = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "federation.freshness_hours",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.cache.memory_target_bytes = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.memory_target_bytes",
            ..
        })
    ));
}

#[test]
fn non_finite_ratios_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.ratios.emoji = f64::NAN;
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.ratios.emoji",
            ..
        })
    ));
}

#[test]
fn negative_ratio_passes_through_as_literal() {
    let mut raw = RawSettings::default();
    raw.cache.ratios.account = -500.0;
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.ratios.account, -500.0);
}

#[test]
fn json_logging_switches_format() {
    let mut raw = RawSettings::default();
    raw.apply_overrides(&GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn invalid_log_level_is_reported() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "logging.level",
            ..
        })
    ));
}

#[test]
fn cli_parses_resolve_and_domain_commands() {
    let args = CliArgs::try_parse_from(["fedcache", "resolve", "@alice@remote.example", "--force"])
        .expect("parse");
    match args.command {
        Command::Resolve(resolve) => {
            assert_eq!(resolve.target, "@alice@remote.example");
            assert!(resolve.force);
            assert_eq!(resolve.requester, "");
        }
        other => panic!("unexpected command {other:?}"),
    }

    let args = CliArgs::try_parse_from(["fedcache", "--ephemeral", "domain", "block", "bad.example"])
        .expect("parse");
    assert!(args.overrides.ephemeral);
    assert!(matches!(
        args.command,
        Command::Domain(DomainArgs {
            command: DomainCommand::Block(_)
        })
    ));
}
