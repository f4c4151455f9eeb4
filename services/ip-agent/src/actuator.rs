//! Host interface actuation.
//!
//! The actuator is the capability the reconcile worker uses to attach
//! and detach floating addresses. Both operations are idempotent:
//! adding an address that is already present and removing one that is
//! already absent are successes, so a coalesced or repeated
//! reconciliation pass never fails on converged state.
//!
//! The Linux implementation shells out to `ip addr`; a mock
//! implementation records calls for tests and dev bootstrap.

use std::collections::HashSet;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from interface address operations.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to add address: {0}")]
    AddFailed(String),

    #[error("failed to remove address: {0}")]
    RemoveFailed(String),

    #[error("command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Interface address actuator.
#[async_trait]
pub trait AddressActuator: Send + Sync {
    /// Ensure `cidr` is present on `iface`.
    async fn add(&self, iface: &str, cidr: &str) -> Result<(), ActuatorError>;

    /// Ensure `cidr` is absent from `iface`.
    async fn remove(&self, iface: &str, cidr: &str) -> Result<(), ActuatorError>;
}

/// Actuator backed by the `ip` command.
pub struct LinuxAddressActuator;

impl LinuxAddressActuator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxAddressActuator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressActuator for LinuxAddressActuator {
    async fn add(&self, iface: &str, cidr: &str) -> Result<(), ActuatorError> {
        info!(iface, cidr, "Adding address");
        match run_ip(&["addr", "add", cidr, "dev", iface])? {
            IpOutcome::Ok => Ok(()),
            IpOutcome::Failed(stderr) if address_already_present(&stderr) => {
                debug!(iface, cidr, "Address already present");
                Ok(())
            }
            IpOutcome::Failed(stderr) => Err(ActuatorError::AddFailed(stderr)),
        }
    }

    async fn remove(&self, iface: &str, cidr: &str) -> Result<(), ActuatorError> {
        info!(iface, cidr, "Removing address");
        match run_ip(&["addr", "del", cidr, "dev", iface])? {
            IpOutcome::Ok => Ok(()),
            IpOutcome::Failed(stderr) if address_already_absent(&stderr) => {
                debug!(iface, cidr, "Address already absent");
                Ok(())
            }
            IpOutcome::Failed(stderr) => Err(ActuatorError::RemoveFailed(stderr)),
        }
    }
}

enum IpOutcome {
    Ok,
    Failed(String),
}

/// Run an `ip` command and capture the failure text.
fn run_ip(args: &[&str]) -> Result<IpOutcome, ActuatorError> {
    let output = Command::new("ip").args(args).output()?;

    if output.status.success() {
        Ok(IpOutcome::Ok)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(IpOutcome::Failed(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr
        )))
    }
}

/// `ip addr add` on an address that is already configured.
fn address_already_present(stderr: &str) -> bool {
    stderr.contains("File exists")
}

/// `ip addr del` on an address that is not configured.
fn address_already_absent(stderr: &str) -> bool {
    stderr.contains("Cannot assign requested address")
}

/// A single recorded actuator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorCall {
    Add { iface: String, cidr: String },
    Remove { iface: String, cidr: String },
}

/// Mock actuator for tests and development.
///
/// Tracks the set of addresses "present" on each interface and records
/// every call, so tests can assert both the end state and the call
/// sequence. Can be switched into a failing mode to exercise retry
/// paths.
#[derive(Default)]
pub struct MockActuator {
    present: Mutex<HashSet<(String, String)>>,
    calls: Mutex<Vec<ActuatorCall>>,
    failing: AtomicBool,
}

impl MockActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Addresses currently present on an interface.
    pub fn addresses(&self, iface: &str) -> Vec<String> {
        let present = self.present.lock().expect("mock actuator lock poisoned");
        let mut addrs: Vec<String> = present
            .iter()
            .filter(|(i, _)| i == iface)
            .map(|(_, cidr)| cidr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.calls.lock().expect("mock actuator lock poisoned").clone()
    }

    fn record(&self, call: ActuatorCall) {
        self.calls
            .lock()
            .expect("mock actuator lock poisoned")
            .push(call);
    }
}

#[async_trait]
impl AddressActuator for MockActuator {
    async fn add(&self, iface: &str, cidr: &str) -> Result<(), ActuatorError> {
        self.record(ActuatorCall::Add {
            iface: iface.to_string(),
            cidr: cidr.to_string(),
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(ActuatorError::AddFailed("mock actuator failing".into()));
        }
        let mut present = self.present.lock().expect("mock actuator lock poisoned");
        present.insert((iface.to_string(), cidr.to_string()));
        Ok(())
    }

    async fn remove(&self, iface: &str, cidr: &str) -> Result<(), ActuatorError> {
        self.record(ActuatorCall::Remove {
            iface: iface.to_string(),
            cidr: cidr.to_string(),
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(ActuatorError::RemoveFailed("mock actuator failing".into()));
        }
        let mut present = self.present.lock().expect("mock actuator lock poisoned");
        present.remove(&(iface.to_string(), cidr.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_present_is_recognized() {
        assert!(address_already_present("RTNETLINK answers: File exists"));
        assert!(!address_already_present("RTNETLINK answers: Operation not permitted"));
    }

    #[test]
    fn test_already_absent_is_recognized() {
        assert!(address_already_absent(
            "RTNETLINK answers: Cannot assign requested address"
        ));
        assert!(!address_already_absent("RTNETLINK answers: File exists"));
    }

    #[tokio::test]
    async fn test_mock_add_remove_idempotent() {
        let actuator = MockActuator::new();

        actuator.add("eth0", "10.0.0.1/32").await.unwrap();
        actuator.add("eth0", "10.0.0.1/32").await.unwrap();
        assert_eq!(actuator.addresses("eth0"), vec!["10.0.0.1/32"]);

        actuator.remove("eth0", "10.0.0.1/32").await.unwrap();
        actuator.remove("eth0", "10.0.0.1/32").await.unwrap();
        assert!(actuator.addresses("eth0").is_empty());
    }

    #[tokio::test]
    async fn test_mock_failing_mode() {
        let actuator = MockActuator::new();
        actuator.set_failing(true);

        assert!(actuator.add("eth0", "10.0.0.1/32").await.is_err());
        assert!(actuator.addresses("eth0").is_empty());

        actuator.set_failing(false);
        actuator.add("eth0", "10.0.0.1/32").await.unwrap();
        assert_eq!(actuator.addresses("eth0"), vec!["10.0.0.1/32"]);
    }
}
