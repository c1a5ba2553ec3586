//! Tests for queue options loading and validation.

use super::*;
use serial_test::serial;
use std::io::Write;

fn valid_options() -> QueueOptions {
    QueueOptions {
        host: "broker.local".to_string(),
        port: 5672,
        user: "guest".to_string(),
        password: Secret::new("guest"),
        partition_id: "p1".to_string(),
        max_retries: 3,
        max_priority: 10,
        ..Default::default()
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_valid_options_pass() {
        assert!(valid_options().validate().is_ok());
        assert!(valid_options().validate_partition().is_ok());
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let options = QueueOptions::default();
        assert_eq!(options.link_credit, 2);
        assert_eq!(options.poll_timeout(), Duration::from_millis(100));
        assert_eq!(options.scheme, AmqpScheme::Amqp);
        assert!(options.session_pool_size >= 1);
        assert_eq!(options.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert_eq!(options.retry_max_delay_ms, DEFAULT_RETRY_MAX_DELAY_MS);
    }

    #[test]
    fn test_required_numbers_have_no_usable_default() {
        let options = QueueOptions::default();
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.max_priority, 0);
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let options = QueueOptions {
            host: String::new(),
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "Host"));
    }

    #[test]
    fn test_missing_user_is_rejected() {
        let options = QueueOptions {
            user: String::new(),
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "User"));
    }

    #[test]
    fn test_missing_password_is_rejected() {
        let options = QueueOptions {
            password: Secret::default(),
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "Password"));
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let options = QueueOptions {
            port: 0,
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "Port"));
    }

    #[test]
    fn test_zero_max_retries_is_rejected() {
        let options = QueueOptions {
            max_retries: 0,
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "MaxRetries"));
    }

    #[test]
    fn test_zero_max_priority_is_rejected() {
        let options = QueueOptions {
            max_priority: 0,
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::BelowMinimum { ref key, minimum: 1 } if key == "MaxPriority"
        ));
    }

    #[test]
    fn test_zero_link_credit_is_rejected() {
        let options = QueueOptions {
            link_credit: 0,
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::BelowMinimum { ref key, minimum: 1 } if key == "LinkCredit"
        ));
    }

    #[test]
    fn test_zero_retry_delay_is_rejected() {
        let options = QueueOptions {
            retry_delay_ms: 0,
            ..valid_options()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::BelowMinimum { ref key, minimum: 1 } if key == "RetryDelayMs"
        ));
    }

    #[test]
    fn test_empty_partition_only_fails_partition_check() {
        let options = QueueOptions {
            partition_id: String::new(),
            ..valid_options()
        };
        assert!(options.validate().is_ok());
        let err = options.validate_partition().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "PartitionId"));
    }
}

// ============================================================================
// Secret and Address Tests
// ============================================================================

mod secrets {
    use super::*;

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let secret = Secret::new("hunter2");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_options_debug_does_not_leak_password() {
        let options = QueueOptions {
            password: Secret::new("s3cr3t-value"),
            ..valid_options()
        };
        let debug = format!("{:?}", options);
        assert!(debug.contains("broker.local"));
        assert!(!debug.contains("s3cr3t-value"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_address_url_excludes_credentials() {
        let options = QueueOptions {
            scheme: AmqpScheme::Amqps,
            ..valid_options()
        };
        let address = options.address();

        assert_eq!(address.url(), "amqps://broker.local:5672/");
        assert_eq!(address.to_string(), "amqps://broker.local:5672/");
        assert_eq!(address.user(), "guest");
        assert_eq!(address.password().expose_secret(), "guest");
        assert!(address.scheme().is_tls());
    }
}

// ============================================================================
// Loading Tests
// ============================================================================

mod loading {
    use super::*;

    const BASE_JSON: &str = r#"{
        "Amqp": {
            "Host": "rabbitmq",
            "Port": 5672,
            "User": "admin",
            "Password": "admin",
            "MaxPriority": 25,
            "MaxRetries": 3,
            "LinkCredit": 4,
            "PartitionId": "TestPartition",
            "Scheme": "AMQPS"
        }
    }"#;

    #[test]
    fn test_load_reads_amqp_section() {
        let builder = Config::builder().add_source(config::File::from_str(BASE_JSON, FileFormat::Json));

        let options = QueueOptions::load(builder).expect("options should load");

        assert_eq!(options.host, "rabbitmq");
        assert_eq!(options.port, 5672);
        assert_eq!(options.max_priority, 25);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.link_credit, 4);
        assert_eq!(options.partition_id, "TestPartition");
        assert_eq!(options.scheme, AmqpScheme::Amqps);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_load_applies_defaults_for_absent_fields() {
        let json = r#"{ "Amqp": { "Host": "rabbitmq" } }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let options = QueueOptions::load(builder).expect("options should load");

        assert_eq!(options.link_credit, DEFAULT_LINK_CREDIT);
        assert_eq!(options.poll_timeout_ms, DEFAULT_POLL_TIMEOUT_MS);
        assert!(options.validate().is_err(), "port and credentials still missing");
    }

    #[test]
    fn test_section_without_max_retries_fails_validation() {
        let json = r#"{
            "Amqp": {
                "Host": "rabbitmq",
                "Port": 5672,
                "User": "admin",
                "Password": "admin",
                "PartitionId": "TestPartition"
            }
        }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let options = QueueOptions::load(builder).expect("options should load");

        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { ref key } if key == "MaxRetries"));
    }

    #[test]
    fn test_section_without_max_priority_fails_validation() {
        let json = r#"{
            "Amqp": {
                "Host": "rabbitmq",
                "Port": 5672,
                "User": "admin",
                "Password": "admin",
                "MaxRetries": 3
            }
        }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let options = QueueOptions::load(builder).expect("options should load");

        let err = options.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::BelowMinimum { ref key, .. } if key == "MaxPriority"));
    }

    #[test]
    fn test_bad_value_reports_the_field() {
        let json = r#"{ "Amqp": { "Host": "rabbitmq", "Port": "not-a-port" } }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let err = QueueOptions::load(builder).unwrap_err();

        let ConfigurationError::Parsing { message } = err else {
            panic!("expected a parsing error, got {err}");
        };
        assert!(message.contains("Port"), "message should name the field: {message}");
        assert!(message.contains("not-a-port"), "message should show the value: {message}");
        assert!(!message.contains("missing"), "section is present: {message}");
    }

    #[test]
    fn test_lower_case_section_is_accepted() {
        let json = r#"{ "amqp": { "host": "rabbitmq", "port": 5672 } }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let options = QueueOptions::load(builder).expect("options should load");

        assert_eq!(options.host, "rabbitmq");
        assert_eq!(options.port, 5672);
    }

    #[test]
    fn test_absent_section_is_reported_missing() {
        let json = r#"{ "Other": { "Host": "rabbitmq" } }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let err = QueueOptions::load(builder).unwrap_err();

        assert!(matches!(err, ConfigurationError::Parsing { ref message } if message.contains("amqp")));
    }

    #[test]
    fn test_credentials_file_overrides_section() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("temp file");
        write!(
            file,
            r#"{{ "Amqp": {{ "User": "from-file", "Password": "file-secret" }} }}"#
        )
        .expect("write credentials");

        let json = format!(
            r#"{{ "Amqp": {{ "Host": "rabbitmq", "Port": 5672, "User": "inline", "MaxRetries": 3, "MaxPriority": 10, "CredentialsPath": {:?} }} }}"#,
            file.path().display().to_string()
        );
        let builder = Config::builder().add_source(config::File::from_str(&json, FileFormat::Json));

        let options = QueueOptions::load(builder).expect("options should load");

        assert_eq!(options.user, "from-file");
        assert_eq!(options.password.expose_secret(), "file-secret");
        assert_eq!(options.host, "rabbitmq");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_file_is_an_error() {
        let json = r#"{ "Amqp": { "Host": "rabbitmq", "CredentialsPath": "/nonexistent/amqp-credentials.json" } }"#;
        let builder = Config::builder().add_source(config::File::from_str(json, FileFormat::Json));

        let result = QueueOptions::load(builder);

        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_prefixed_variables() {
        std::env::set_var("Amqp__Host", "env-broker");
        std::env::set_var("Amqp__Port", "5673");
        std::env::set_var("Amqp__User", "env-user");
        std::env::set_var("Amqp__Password", "env-pass");
        std::env::set_var("Amqp__LinkCredit", "1");

        let result = QueueOptions::from_env();

        for key in ["Host", "Port", "User", "Password", "LinkCredit"] {
            std::env::remove_var(format!("Amqp__{}", key));
        }

        let options = result.expect("options should load from env");
        assert_eq!(options.host, "env-broker");
        assert_eq!(options.port, 5673);
        assert_eq!(options.user, "env-user");
        assert_eq!(options.password.expose_secret(), "env-pass");
        assert_eq!(options.link_credit, 1);
    }
}
