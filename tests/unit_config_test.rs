use renderbroker::config::{AllocatorKind, Config};

#[test]
fn test_empty_config_uses_defaults() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 8095);
    assert_eq!(config.base_url_prefix, "/rrm/v1");
    assert_eq!(config.allocator, AllocatorKind::Local);
    assert_eq!(config.session.keep_alive_timeout_secs, 600);
    assert_eq!(config.session.sweep_interval_secs, 100);
    assert_eq!(config.session.request_timeout_secs, 5);
    assert_eq!(config.session.vocabulary_path, "registry");
    assert_eq!(config.session.exit_path, "v1/exit");
    assert_eq!(config.session.default_renderer_port, 3000);
    assert_eq!(config.unicore.max_log_size, 2_048_000);
}

#[test]
fn test_full_slurm_config_parses() {
    let config = Config::from_toml(
        r#"
            host = "0.0.0.0"
            port = 8095
            allocator = "slurm"

            [session]
            keep_alive_timeout_secs = 7260

            [slurm]
            username = "vizuser"
            ssh_key = "/etc/keys/viz"
            hosts = ["bbpviz1.cscs.ch", "bbpviz2.cscs.ch"]
            default_queue = "interactive"
            default_time = "08:00:00"
        "#,
    )
    .unwrap();
    assert_eq!(config.allocator, AllocatorKind::Slurm);
    assert_eq!(config.slurm.hosts.len(), 2);
    assert_eq!(config.slurm.allocation_timeout_secs, 10);
    assert_eq!(config.session.keep_alive_timeout_secs, 7260);
}

#[test]
fn test_slurm_allocator_requires_hosts() {
    let result = Config::from_toml(
        r#"
            allocator = "slurm"

            [slurm]
            username = "vizuser"
            ssh_key = "/etc/keys/viz"
        "#,
    );
    assert!(result.is_err());
}

#[test]
fn test_unicore_allocator_requires_registry() {
    let result = Config::from_toml(
        r#"
            allocator = "unicore"

            [unicore]
            default_site = "JUQUEEN"
        "#,
    );
    assert!(result.is_err());
}

#[test]
fn test_unicore_config_parses() {
    let config = Config::from_toml(
        r#"
            allocator = "unicore"

            [unicore]
            registry_url = "https://hbp-unic.fz-juelich.de:7112/HBP/rest/registries/default_registry"
            default_site = "JUQUEEN"
        "#,
    )
    .unwrap();
    assert_eq!(config.allocator, AllocatorKind::Unicore);
    assert_eq!(config.unicore.default_site, "JUQUEEN");
}

#[test]
fn test_port_zero_is_rejected() {
    assert!(Config::from_toml("port = 0").is_err());
}

#[test]
fn test_prefix_must_be_absolute() {
    assert!(Config::from_toml("base_url_prefix = \"rrm/v1\"").is_err());
}

#[test]
fn test_zero_keep_alive_is_rejected() {
    assert!(
        Config::from_toml(
            r#"
                [session]
                keep_alive_timeout_secs = 0
            "#
        )
        .is_err()
    );
}

#[test]
fn test_bad_toml_is_rejected() {
    assert!(Config::from_toml("port = \"not a number\"").is_err());
}

#[test]
fn test_from_file_reads_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "port = 9000\n").unwrap();
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.port, 9000);
}

#[test]
fn test_from_file_missing_file_is_an_error() {
    assert!(Config::from_file("/nonexistent/renderbroker.toml").is_err());
}
