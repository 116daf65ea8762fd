//! Wireless SSID and WPA2 key.
//!
//! SSID and key are applied independently: one failing does not stop the
//! other. The interface is restarted once at the end if anything was
//! applied, since the radio only picks up security-profile changes on
//! restart.

use log::{info, warn};
use secrecy::SecretString;

use super::{Reconciler, ResourceKind, ResourceRef, StepLog, unsupported};
use crate::driver::{Command, Executor, Value};
use crate::error::{Error, Result, ValidationError};
use crate::parser::Record;
use crate::transport::Transport;

const MENU: &str = "/interface wireless";
const PROFILES: &str = "/interface wireless security-profiles";

/// Desired wireless settings; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct WirelessSpec {
    pub ssid: Option<String>,
    pub password: Option<SecretString>,
}

impl WirelessSpec {
    pub fn new(ssid: Option<String>, password: Option<SecretString>) -> Self {
        Self { ssid, password }
    }

    pub fn ssid(mut self, ssid: impl Into<String>) -> Self {
        self.ssid = Some(ssid.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }
}

/// Typed view of a wireless interface. Keys are never read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessView {
    pub reference: ResourceRef,
    pub name: String,
    pub ssid: Option<String>,
    pub mode: Option<String>,
    pub band: Option<String>,
    pub frequency: Option<String>,
    pub security_profile: Option<String>,
    pub enabled: bool,
    pub running: bool,
}

impl WirelessView {
    pub fn from_record(record: &Record, epoch: u64) -> Option<Self> {
        let name = record.get("name")?.to_string();
        Some(Self {
            reference: ResourceRef::new(ResourceKind::Wireless, name.clone(), epoch),
            ssid: record.get("ssid").map(str::to_string),
            mode: record.get("mode").map(str::to_string),
            band: record.get("band").map(str::to_string),
            frequency: record.get("frequency").map(str::to_string),
            security_profile: record.get("security-profile").map(str::to_string),
            enabled: !record.has_flag('X'),
            running: record.has_flag('R'),
            name,
        })
    }
}

/// Reconciler for `/interface wireless`.
pub struct WirelessReconciler<'a, T> {
    exec: Executor<'a, T>,
    interface: String,
}

impl<'a, T: Transport> WirelessReconciler<'a, T> {
    /// `interface` is the radio the settings are applied to.
    pub fn new(exec: Executor<'a, T>, interface: impl Into<String>) -> Self {
        Self {
            exec,
            interface: interface.into(),
        }
    }

    pub async fn interfaces(&self) -> Result<Vec<WirelessView>> {
        let epoch = self.exec.epoch();
        Ok(self
            .list()
            .await?
            .iter()
            .filter_map(|r| WirelessView::from_record(r, epoch))
            .collect())
    }

    /// Apply settings to the configured interface.
    pub async fn apply(&self, spec: WirelessSpec) -> Result<()> {
        let target = ResourceRef::new(
            ResourceKind::Wireless,
            self.interface.clone(),
            self.exec.epoch(),
        );
        self.update(&target, spec).await
    }
}

impl<T: Transport> Reconciler for WirelessReconciler<'_, T> {
    type Spec = WirelessSpec;
    const KIND: ResourceKind = ResourceKind::Wireless;

    async fn list(&self) -> Result<Vec<Record>> {
        let command = Command::builder(MENU, "print")
            .flag("terse")
            .flag("show-ids")
            .build();
        self.exec.list(&command).await
    }

    async fn create(&self, _spec: WirelessSpec) -> Result<ResourceRef> {
        unsupported(Self::KIND, "create")
    }

    async fn update(&self, target: &ResourceRef, spec: WirelessSpec) -> Result<()> {
        self.exec.check_ref(target, Self::KIND)?;
        if spec.ssid.is_none() && spec.password.is_none() {
            return Err(ValidationError::NothingToApply("neither ssid nor password given").into());
        }

        // Validate everything before the first command goes out
        let interface = Value::text("interface", &target.id, 1, 64)?;
        let ssid = spec
            .ssid
            .as_deref()
            .map(|s| Value::text("ssid", s, 1, 32))
            .transpose()?;
        let password = spec
            .password
            .as_ref()
            .map(|p| Value::secret("password", p, 8, 63))
            .transpose()?;

        let mut commands = Vec::new();
        if let Some(ssid) = &ssid {
            let command = Command::builder(MENU, "set")
                .find("name", &interface)
                .arg("ssid", ssid)
                .build();
            commands.push(("ssid", command));
        }
        if let Some(password) = &password {
            let command = Command::builder(PROFILES, "set")
                .find_default()
                .arg("mode", &Value::keyword("dynamic-keys"))
                .arg("authentication-types", &Value::keyword("wpa2-psk"))
                .arg("wpa2-pre-shared-key", password)
                .build();
            commands.push(("password", command));
        }

        let mut steps = StepLog::new(format!("wireless settings on {}", target.id));
        let mut failures: Vec<(&str, Error)> = Vec::new();

        for &(label, ref command) in &commands {
            match self.exec.execute(command).await {
                Ok(_) => steps.commit(label),
                Err(e) => {
                    warn!("wireless {label} change on {} failed: {e}", target.id);
                    let reconnect = e.requires_reconnect();
                    failures.push((label, e));
                    if reconnect {
                        break;
                    }
                }
            }
        }

        if !steps.committed().is_empty() && !failures.iter().any(|(_, e)| e.requires_reconnect())
        {
            for verb in ["disable", "enable"] {
                let command = Command::builder(MENU, verb).find("name", &interface).build();
                match self.exec.execute(&command).await {
                    Ok(_) => steps.commit(verb),
                    Err(e) => {
                        failures.push((verb, e));
                        break;
                    }
                }
            }
        }

        match failures.into_iter().next() {
            None => {
                info!("wireless settings applied on {}", target.id);
                Ok(())
            }
            Some((label, cause)) => Err(steps.fail(label, cause)),
        }
    }

    async fn delete(&self, _target: &ResourceRef) -> Result<()> {
        unsupported(Self::KIND, "delete")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::ConnectionManager;
    use crate::platform;
    use crate::testing::{MockConnector, MockTransport, Reply, ssh_config};

    async fn manager(transport: &MockTransport) -> ConnectionManager<MockConnector> {
        let manager = ConnectionManager::new(MockConnector::new(transport.clone()));
        manager.connect(&ssh_config()).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_both_fields_then_single_restart() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let spec = WirelessSpec::default()
            .ssid("Cafe Guest")
            .password("correct-horse");
        WirelessReconciler::new(exec, "wlan1").apply(spec).await.unwrap();

        assert_eq!(
            transport.commands(),
            vec![
                r#"/interface wireless set [find name="wlan1"] ssid="Cafe Guest""#.to_string(),
                r#"/interface wireless security-profiles set [find default=yes] mode=dynamic-keys authentication-types=wpa2-psk wpa2-pre-shared-key="correct-horse""#.to_string(),
                r#"/interface wireless disable [find name="wlan1"]"#.to_string(),
                r#"/interface wireless enable [find name="wlan1"]"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ssid_only_still_restarts_once() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        WirelessReconciler::new(exec, "wlan1")
            .apply(WirelessSpec::default().ssid("Lab"))
            .await
            .unwrap();
        let commands = transport.commands();
        assert_eq!(commands.len(), 3);
        assert!(!commands.iter().any(|c| c.contains("security-profiles")));
        assert_eq!(commands.iter().filter(|c| c.contains(" disable ")).count(), 1);
    }

    #[tokio::test]
    async fn test_key_failure_keeps_ssid_change() {
        let transport = MockTransport::new();
        transport.on("security-profiles set", |_| {
            Reply::stdout("failure: profile is locked")
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let spec = WirelessSpec::default()
            .ssid("Cafe Guest")
            .password("correct-horse");
        let err = WirelessReconciler::new(exec, "wlan1")
            .apply(spec)
            .await
            .unwrap_err();
        match &err {
            Error::PartialSuccess(partial) => {
                assert_eq!(partial.committed, vec!["ssid", "disable", "enable"]);
                assert_eq!(partial.failed_step, "password");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.to_string().contains("correct-horse"));
        assert!(!format!("{err:?}").contains("correct-horse"));
    }

    #[tokio::test]
    async fn test_ssid_failure_keeps_key_change() {
        let transport = MockTransport::new();
        transport.on("ssid=", |_| Reply::stderr("invalid value for argument ssid"));
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let spec = WirelessSpec::default()
            .ssid("Cafe Guest")
            .password("correct-horse");
        match WirelessReconciler::new(exec, "wlan1").apply(spec).await {
            Err(Error::PartialSuccess(partial)) => {
                assert_eq!(partial.committed, vec!["password", "disable", "enable"]);
                assert_eq!(partial.failed_step, "ssid");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nothing_applied_returns_first_error() {
        let transport = MockTransport::new();
        transport.on("ssid=", |_| Reply::stdout("failure: radio busy"));
        transport.on("security-profiles set", |_| Reply::stdout("failure: profile is locked"));
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let spec = WirelessSpec::default()
            .ssid("Cafe Guest")
            .password("correct-horse");
        let err = WirelessReconciler::new(exec, "wlan1")
            .apply(spec)
            .await
            .unwrap_err();
        assert_eq!(err.device_message(), Some("failure: radio busy"));
        assert!(!transport.commands().iter().any(|c| c.contains("disable")));
    }

    #[tokio::test]
    async fn test_validation_before_any_command() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));
        let wireless = WirelessReconciler::new(exec, "wlan1");

        let err = wireless.apply(WirelessSpec::default()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::NothingToApply(_))
        ));

        let short = WirelessSpec::default().ssid("Lab").password("short");
        assert!(matches!(
            wireless.apply(short).await,
            Err(Error::Validation(ValidationError::Length { .. }))
        ));

        let long = WirelessSpec::default().ssid("x".repeat(33));
        assert!(wireless.apply(long).await.is_err());

        let injected = WirelessSpec::default().ssid(r#"x" disabled=yes"#);
        assert!(wireless.apply(injected).await.is_err());

        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_list_wireless() {
        let transport = MockTransport::new();
        transport.on("/interface wireless print", |_| {
            Reply::stdout(
                " *5 R name=wlan1 mode=ap-bridge ssid=Cafe Guest band=2ghz-b/g/n frequency=2437 security-profile=default",
            )
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let views = WirelessReconciler::new(exec, "wlan1").interfaces().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].ssid.as_deref(), Some("Cafe Guest"));
        assert!(views[0].running);
        assert_eq!(views[0].security_profile.as_deref(), Some("default"));
    }
}
