//! Discovery storage.
//!
//! A machine is keyed by its boot MAC. Each report replaces the machine's
//! interfaces, disks and neighbors wholesale; the machine row itself is
//! never deleted, so the discovered set only grows.

use std::collections::HashMap;

use metalcast_id::{MacAddress, MachineUuid};
use metalcast_model::{
    BootInfo, DiscoveryReport, LldpChassis, LldpData, LldpNeighbor, LldpPort, LldpReport,
    ReportedDisk, ReportedInterface,
};
use sqlx::SqlitePool;
use tracing::{debug, info, instrument};

use super::{from_millis, now_millis, DbError};

/// Discovery store handle.
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    pool: SqlitePool,
}

impl DiscoveryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a machine's facts.
    ///
    /// The report must already be normalized (boot interface marked).
    /// Returns true when the MAC was not known before.
    #[instrument(skip(self, report), fields(mac = %report.boot_info.mac))]
    pub async fn upsert(&self, report: &DiscoveryReport) -> Result<bool, DbError> {
        let mac = report.boot_info.mac.to_string();
        let now = now_millis();

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT created_at FROM machines WHERE mac = ?1")
            .bind(&mac)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        let is_new = existing.is_none();

        if is_new {
            sqlx::query(
                "INSERT INTO machines (mac, uuid, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            )
            .bind(&mac)
            .bind(report.boot_info.uuid.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        } else {
            sqlx::query("UPDATE machines SET uuid = ?2, updated_at = ?3 WHERE mac = ?1")
                .bind(&mac)
                .bind(report.boot_info.uuid.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(DbError::Query)?;
        }

        for table in ["machine_interfaces", "machine_disks", "machine_lldp"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE machine_mac = ?1"))
                .bind(&mac)
                .execute(&mut *tx)
                .await
                .map_err(DbError::Query)?;
        }

        for (position, interface) in report.interfaces.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO machine_interfaces
                    (machine_mac, position, name, mac, ipv4, cidrv4, netmask, gateway, fqdn, as_boot)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(&mac)
            .bind(position as i64)
            .bind(&interface.name)
            .bind(interface.mac.to_string())
            .bind(interface.ipv4.to_string())
            .bind(&interface.cidrv4)
            .bind(i64::from(interface.netmask))
            .bind(interface.gateway.to_string())
            .bind(interface.fqdn.as_deref())
            .bind(interface.as_boot)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }

        for (position, disk) in report.disks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO machine_disks (machine_mac, position, path, size_bytes) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&mac)
            .bind(position as i64)
            .bind(&disk.path)
            .bind(disk.size_bytes as i64)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }

        let neighbors = report
            .lldp
            .as_ref()
            .and_then(|lldp| lldp.data.as_ref())
            .map(|data| data.interfaces.as_slice())
            .unwrap_or_default();
        for (position, neighbor) in neighbors.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO machine_lldp (machine_mac, position, port_id, chassis_id, chassis_name)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&mac)
            .bind(position as i64)
            .bind(&neighbor.port.id)
            .bind(&neighbor.chassis.id)
            .bind(&neighbor.chassis.name)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }

        tx.commit().await.map_err(DbError::Query)?;

        info!(
            new = is_new,
            interfaces = report.interfaces.len(),
            disks = report.disks.len(),
            "Discovery report stored"
        );
        Ok(is_new)
    }

    /// Every discovered machine, oldest first.
    #[instrument(skip(self))]
    pub async fn fetch_all(&self) -> Result<Vec<DiscoveryReport>, DbError> {
        let machines = sqlx::query_as::<_, MachineRow>(
            "SELECT mac, uuid, created_at, updated_at FROM machines ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut interfaces: HashMap<String, Vec<ReportedInterface>> = HashMap::new();
        for row in sqlx::query_as::<_, InterfaceRow>(
            r#"
            SELECT machine_mac, name, mac, ipv4, cidrv4, netmask, gateway, fqdn, as_boot
            FROM machine_interfaces
            ORDER BY machine_mac, position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        {
            let key = row.machine_mac.clone();
            interfaces.entry(key).or_default().push(row.into_interface()?);
        }

        let mut disks: HashMap<String, Vec<ReportedDisk>> = HashMap::new();
        for row in sqlx::query_as::<_, DiskRow>(
            "SELECT machine_mac, path, size_bytes FROM machine_disks ORDER BY machine_mac, position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        {
            let key = row.machine_mac.clone();
            disks.entry(key).or_default().push(row.into_disk());
        }

        let mut neighbors: HashMap<String, Vec<LldpNeighbor>> = HashMap::new();
        for row in sqlx::query_as::<_, LldpRow>(
            r#"
            SELECT machine_mac, port_id, chassis_id, chassis_name
            FROM machine_lldp
            ORDER BY machine_mac, position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        {
            neighbors
                .entry(row.machine_mac)
                .or_default()
                .push(LldpNeighbor {
                    chassis: LldpChassis {
                        id: row.chassis_id,
                        name: row.chassis_name,
                    },
                    port: LldpPort { id: row.port_id },
                });
        }

        let mut reports = Vec::with_capacity(machines.len());
        for machine in machines {
            let lldp = neighbors.remove(&machine.mac).map(|interfaces| LldpReport {
                is_file: true,
                data: Some(LldpData { interfaces }),
            });
            reports.push(DiscoveryReport {
                interfaces: interfaces.remove(&machine.mac).unwrap_or_default(),
                disks: disks.remove(&machine.mac).unwrap_or_default(),
                lldp,
                boot_info: machine.into_boot_info()?,
            });
        }

        debug!(count = reports.len(), "Fetched discovery");
        Ok(reports)
    }

    /// Whether a machine with this boot MAC has been discovered.
    pub async fn exists(&self, mac: &MacAddress) -> Result<bool, DbError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM machines WHERE mac = ?1")
            .bind(mac.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(found.is_some())
    }

    pub async fn count(&self) -> Result<i64, DbError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM machines")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug)]
struct MachineRow {
    mac: String,
    uuid: String,
    created_at: i64,
    updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for MachineRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            mac: row.try_get("mac")?,
            uuid: row.try_get("uuid")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl MachineRow {
    fn into_boot_info(self) -> Result<BootInfo, DbError> {
        Ok(BootInfo {
            mac: MacAddress::parse(&self.mac).map_err(|e| DbError::corrupt("machines", e))?,
            uuid: MachineUuid::parse(&self.uuid).map_err(|e| DbError::corrupt("machines", e))?,
            created_date: Some(from_millis(self.created_at)),
            updated_date: Some(from_millis(self.updated_at)),
        })
    }
}

#[derive(Debug)]
pub(crate) struct InterfaceRow {
    pub machine_mac: String,
    pub name: String,
    pub mac: String,
    pub ipv4: String,
    pub cidrv4: String,
    pub netmask: i64,
    pub gateway: String,
    pub fqdn: Option<String>,
    pub as_boot: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for InterfaceRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            machine_mac: row.try_get("machine_mac")?,
            name: row.try_get("name")?,
            mac: row.try_get("mac")?,
            ipv4: row.try_get("ipv4")?,
            cidrv4: row.try_get("cidrv4")?,
            netmask: row.try_get("netmask")?,
            gateway: row.try_get("gateway")?,
            fqdn: row.try_get("fqdn")?,
            as_boot: row.try_get("as_boot")?,
        })
    }
}

impl InterfaceRow {
    pub(crate) fn into_interface(self) -> Result<ReportedInterface, DbError> {
        let corrupt = |e: &dyn std::fmt::Display| DbError::corrupt("machine_interfaces", e);
        Ok(ReportedInterface {
            mac: MacAddress::parse(&self.mac).map_err(|e| corrupt(&e))?,
            ipv4: self.ipv4.parse().map_err(|e| corrupt(&e))?,
            gateway: self.gateway.parse().map_err(|e| corrupt(&e))?,
            netmask: u8::try_from(self.netmask).map_err(|e| corrupt(&e))?,
            name: self.name,
            cidrv4: self.cidrv4,
            fqdn: self.fqdn,
            as_boot: self.as_boot,
        })
    }
}

#[derive(Debug)]
pub(crate) struct DiskRow {
    pub machine_mac: String,
    pub path: String,
    pub size_bytes: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for DiskRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            machine_mac: row.try_get("machine_mac")?,
            path: row.try_get("path")?,
            size_bytes: row.try_get("size_bytes")?,
        })
    }
}

impl DiskRow {
    pub(crate) fn into_disk(self) -> ReportedDisk {
        ReportedDisk {
            path: self.path,
            size_bytes: self.size_bytes.max(0) as u64,
        }
    }
}

#[derive(Debug)]
struct LldpRow {
    machine_mac: String,
    port_id: String,
    chassis_id: String,
    chassis_name: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for LldpRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            machine_mac: row.try_get("machine_mac")?,
            port_id: row.try_get("port_id")?,
            chassis_id: row.try_get("chassis_id")?,
            chassis_name: row.try_get("chassis_name")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testutil::report;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let store = db.discovery_store();
        let m01 = report(1);

        assert!(store.upsert(&m01).await.unwrap());
        for _ in 0..3 {
            assert!(!store.upsert(&m01).await.unwrap());
        }

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let machine = &all[0];
        assert_eq!(machine.boot_info.mac, m01.boot_info.mac);
        assert_eq!(machine.boot_info.uuid, m01.boot_info.uuid);
        assert_eq!(machine.interfaces, m01.interfaces);
        assert_eq!(machine.disks, m01.disks);
        assert!(machine.boot_info.created_date.is_some());
        assert!(store.exists(&m01.boot_info.mac).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_report_wins() {
        let db = Database::in_memory().await.unwrap();
        let store = db.discovery_store();
        let mut m01 = report(1);
        store.upsert(&m01).await.unwrap();

        m01.disks.clear();
        m01.interfaces[0].fqdn = Some("r13-srv3.dc-1.foo.bar".into());
        store.upsert(&m01).await.unwrap();

        let all = store.fetch_all().await.unwrap();
        assert!(all[0].disks.is_empty());
        assert_eq!(
            all[0].interfaces[0].fqdn.as_deref(),
            Some("r13-srv3.dc-1.foo.bar")
        );
    }

    #[tokio::test]
    async fn test_machines_accumulate_in_creation_order() {
        let db = Database::in_memory().await.unwrap();
        let store = db.discovery_store();
        for i in 1..=4 {
            store.upsert(&report(i)).await.unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 4);

        let all = store.fetch_all().await.unwrap();
        let macs: Vec<_> = all.iter().map(|r| r.boot_info.mac).collect();
        assert_eq!(macs, (1..=4).map(|i| report(i).boot_info.mac).collect::<Vec<_>>());
        assert!(all[0].lldp.is_some());
    }
}
