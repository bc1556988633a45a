use anyhow::Result;
use serde::Serialize;
use zbus::{Connection, proxy};

/// Detect if running as root
pub fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

/// Systemd Manager D-Bus proxy
#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    /// List all units
    /// Returns: [(name, description, load_state, active_state, sub_state,
    ///           follower, object_path, job_id, job_type, job_object_path)]
    fn list_units(
        &self,
    ) -> zbus::Result<
        Vec<(
            String,
            String,
            String,
            String,
            String,
            String,
            zbus::zvariant::OwnedObjectPath,
            u32,
            String,
            zbus::zvariant::OwnedObjectPath,
        )>,
    >;
}

#[derive(Clone)]
pub struct SystemdClient {
    connection: Connection,
    user_mode: bool,
}

impl SystemdClient {
    pub async fn new() -> Result<Self> {
        let (connection, user_mode) = if is_root() {
            // Running as root - connect to system bus
            let conn = Connection::system().await?;
            tracing::info!("Connected to system D-Bus as root");
            (conn, false)
        } else {
            // Not root - try user session first
            match Connection::session().await {
                Ok(conn) => {
                    tracing::info!("Connected to user D-Bus session");
                    (conn, true)
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to connect to user session: {}, trying system bus",
                        e
                    );
                    let conn = Connection::system().await?;
                    tracing::info!("Connected to system D-Bus (read-only for non-root)");
                    (conn, false)
                }
            }
        };

        Ok(Self {
            connection,
            user_mode,
        })
    }

    /// Get the manager proxy for making calls
    async fn manager(&self) -> Result<SystemdManagerProxy<'_>> {
        let proxy = SystemdManagerProxy::new(&self.connection).await?;
        Ok(proxy)
    }

    /// List all units
    pub async fn list_units(&self) -> Result<Vec<UnitInfo>> {
        let manager = self.manager().await?;
        let units = manager.list_units().await?;

        let unit_info: Vec<UnitInfo> = units
            .into_iter()
            .map(
                |(name, description, load_state, active_state, sub_state, _, _, _, _, _)| {
                    UnitInfo {
                        name,
                        description,
                        load_state,
                        active_state,
                        sub_state,
                    }
                },
            )
            .collect();

        Ok(unit_info)
    }

    /// Service units sorted by name; these are the values the unit filter
    /// matches against `_SYSTEMD_UNIT`.
    pub async fn list_services(&self) -> Result<Vec<UnitInfo>> {
        let mut services: Vec<UnitInfo> = self
            .list_units()
            .await?
            .into_iter()
            .filter(UnitInfo::is_service)
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(
            "found {} services on the {} bus",
            services.len(),
            if self.user_mode { "session" } else { "system" }
        );
        Ok(services)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitInfo {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

impl UnitInfo {
    pub fn is_service(&self) -> bool {
        self.name.ends_with(".service")
    }

    /// Check if unit is active
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }

    /// Check if unit failed
    pub fn is_failed(&self) -> bool {
        self.active_state == "failed" || self.load_state == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, load: &str, active: &str) -> UnitInfo {
        UnitInfo {
            name: name.to_string(),
            description: String::new(),
            load_state: load.to_string(),
            active_state: active.to_string(),
            sub_state: String::new(),
        }
    }

    #[test]
    fn test_unit_states() {
        let sshd = unit("sshd.service", "loaded", "active");
        assert!(sshd.is_service());
        assert!(sshd.is_active());
        assert!(!sshd.is_failed());

        let broken = unit("broken.mount", "error", "inactive");
        assert!(!broken.is_service());
        assert!(broken.is_failed());
    }
}
