use scanner_trigger::hardware::mock::{MockByteSource, MockPinSource, MockResponseQueue};
use scanner_trigger::hardware::PreopenedDevice;
use scanner_trigger::registry::{self, BackendRegistry, Collaborators};
use scanner_trigger::trigger::TriggerBackend;
use scanner_trigger::{KeyQueue, MonotonicClock, TriggerError, TriggerResult};
use serial_test::serial;

fn table(text: &str) -> toml::Value {
    toml::from_str(text).unwrap()
}

fn create(port_type: &str, config: &str, extra: Collaborators) -> TriggerResult<String> {
    registry::create(port_type, MonotonicClock::shared(), &table(config), extra)
        .map(|device| device.port_type().to_string())
}

#[test]
#[serial]
fn test_every_builtin_round_trips() {
    let keys = || Collaborators::new(KeyQueue::shared());
    let cases: Vec<(&str, &str, Collaborators)> = vec![
        ("dummy", "interval = 0.5", keys()),
        (
            "serial",
            "",
            keys().with_device(PreopenedDevice::Serial(Box::new(MockByteSource::new()))),
        ),
        (
            "parallel",
            "",
            keys().with_device(PreopenedDevice::Parallel(Box::new(MockPinSource::new()))),
        ),
        ("keyboard", "keys = ['5', 't']", keys()),
        (
            "cedrus",
            "",
            keys().with_device(PreopenedDevice::ResponsePad(Box::new(
                MockResponseQueue::new(),
            ))),
        ),
        ("launchscan", "[settings]\nTR = 2.0\nvolumes = 10", keys()),
    ];

    for (port_type, config, extra) in cases {
        assert_eq!(create(port_type, config, extra).unwrap(), port_type);
        let shouted = port_type.to_uppercase();
        let extra = match port_type {
            "serial" => {
                keys().with_device(PreopenedDevice::Serial(Box::new(MockByteSource::new())))
            }
            "parallel" => {
                keys().with_device(PreopenedDevice::Parallel(Box::new(MockPinSource::new())))
            }
            "cedrus" => keys().with_device(PreopenedDevice::ResponsePad(Box::new(
                MockResponseQueue::new(),
            ))),
            _ => keys(),
        };
        assert_eq!(create(&shouted, config, extra).unwrap(), port_type);
    }
}

#[test]
#[serial]
fn test_unknown_port_type() {
    let result = create("fmri-magic", "", Collaborators::new(KeyQueue::shared()));
    assert!(matches!(result, Err(TriggerError::UnknownBackend(_))));
}

#[test]
#[serial]
fn test_missing_port_is_reported_at_creation() {
    let result = create("serial", "baudrate = 9600", Collaborators::new(KeyQueue::shared()));
    assert!(matches!(result, Err(TriggerError::PortNotFound(_))));
    let result = create("parallel", "pin = 10", Collaborators::new(KeyQueue::shared()));
    assert!(matches!(result, Err(TriggerError::PortNotFound(_))));
}

#[test]
#[serial]
fn test_mismatched_preopened_device() {
    let extra = Collaborators::new(KeyQueue::shared())
        .with_device(PreopenedDevice::Parallel(Box::new(MockPinSource::new())));
    let result = create("serial", "", extra);
    assert!(matches!(result, Err(TriggerError::Configuration(_))));
}

struct AlwaysTriggered;

impl TriggerBackend for AlwaysTriggered {
    fn port_type(&self) -> &'static str {
        "always"
    }

    fn open(&mut self) -> TriggerResult<()> {
        Ok(())
    }

    fn close(&mut self) -> TriggerResult<()> {
        Ok(())
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        Ok(true)
    }
}

#[test]
#[serial]
fn test_custom_backend_registration() {
    registry::register("Always", |_ctx| {
        Ok(Box::new(AlwaysTriggered) as Box<dyn TriggerBackend>)
    });
    assert!(registry::registered_port_types().contains(&"always".to_string()));

    let mut device = registry::create(
        "ALWAYS",
        MonotonicClock::shared(),
        &table(""),
        Collaborators::new(KeyQueue::shared()),
    )
    .unwrap();
    device.open().unwrap();
    assert!(device.wait_for_trigger(3).unwrap());
    assert_eq!(device.trigger_count(), 3);
}

#[test]
fn test_local_registry_is_independent() {
    let mut local = BackendRegistry::new();
    assert!(local.port_types().is_empty());
    local.register("always", |_ctx| Ok(Box::new(AlwaysTriggered) as Box<dyn TriggerBackend>));
    let device = local
        .create(
            "always",
            MonotonicClock::shared(),
            &table(""),
            Collaborators::new(KeyQueue::shared()),
        )
        .unwrap();
    assert_eq!(device.port_type(), "always");
}

#[test]
#[serial]
fn test_out_of_range_durations_fail_creation() {
    let cases = [
        ("keyboard", "timeout = 1e20"),
        ("dummy", "interval = 1e20"),
        ("launchscan", "[settings]\nTR = 1e20\nvolumes = 10"),
        ("launchscan", "wait_timeout = 1e20\n[settings]\nTR = 2.0\nvolumes = 10"),
    ];
    for (port_type, config) in cases {
        let result = create(port_type, config, Collaborators::new(KeyQueue::shared()));
        assert!(
            matches!(result, Err(TriggerError::Configuration(_))),
            "{} accepted {:?}",
            port_type,
            config
        );
    }
}
