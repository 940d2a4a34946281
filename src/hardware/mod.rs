pub mod capture;
pub mod monitor;

/// Hardware ingress event consumed by the controller.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum HardwareEvent {
    Connected { device_path: String },
    Disconnected { device_path: String },
}
