//! Machine schedule storage and role queries.

use std::collections::{BTreeMap, HashMap};

use metalcast_id::MacAddress;
use metalcast_model::{parse_roles, ModelError, ScheduleRequest, ScheduleRole, ScheduledMachine};
use metalcast_networking::sort_ip_list;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument};

use super::{SchedulerError, SchedulerResult};
use crate::db::{from_millis, now_millis, DbError, DiskRow, InterfaceRow};

/// Schedule store handle.
#[derive(Debug, Clone)]
pub struct MachineScheduleStore {
    pool: SqlitePool,
}

impl MachineScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add roles to the machine named by the selector.
    ///
    /// Roles are merged with the ones already held, in request order; nothing
    /// is ever removed. All role names are validated before any write.
    /// Returns the machine's roles after the merge.
    #[instrument(skip(self, request), fields(mac = %request.selector.mac))]
    pub async fn create_schedule(
        &self,
        request: &ScheduleRequest,
    ) -> SchedulerResult<Vec<ScheduleRole>> {
        if request.selector.mac.trim().is_empty() {
            return Err(SchedulerError::InvalidSelector(
                "selector.mac is required".to_string(),
            ));
        }
        let mac = MacAddress::parse(&request.selector.mac)
            .map_err(|e| SchedulerError::InvalidSelector(e.to_string()))?;
        let roles = parse_roles(&request.roles).map_err(|e| match e {
            ModelError::UnknownRole(name) => SchedulerError::UnknownRole(name),
            other => SchedulerError::InvalidSelector(other.to_string()),
        })?;

        let mut tx = self.pool.begin().await?;

        if !machine_exists(&mut tx, &mac).await? {
            return Err(SchedulerError::UnknownMachine(mac.to_string()));
        }

        let added = insert_roles(&mut tx, &mac, &roles, now_millis()).await?;
        let current = roles_by_mac(&mut tx, &mac).await?;
        tx.commit().await?;

        if added > 0 {
            info!(added, roles = ?current, "Schedule updated");
        } else {
            debug!("Schedule unchanged");
        }
        Ok(current)
    }

    /// Ordered roles of a machine; empty if it has none or is unknown.
    pub async fn get_roles_by_mac_selector(
        &self,
        mac: &MacAddress,
    ) -> SchedulerResult<Vec<ScheduleRole>> {
        let mut conn = self.pool.acquire().await?;
        roles_by_mac(&mut conn, mac).await
    }

    /// Every machine holding at least one role, with its ordered roles.
    pub async fn get_all_schedules(
        &self,
    ) -> SchedulerResult<BTreeMap<MacAddress, Vec<ScheduleRole>>> {
        let mut conn = self.pool.acquire().await?;
        all_schedules(&mut conn).await
    }

    /// Machines holding the role.
    pub async fn get_machines_by_role(
        &self,
        role: ScheduleRole,
    ) -> SchedulerResult<Vec<ScheduledMachine>> {
        self.get_machines_by_roles(&[role]).await
    }

    /// Machines holding all of the roles, ordered by MAC.
    pub async fn get_machines_by_roles(
        &self,
        roles: &[ScheduleRole],
    ) -> SchedulerResult<Vec<ScheduledMachine>> {
        let mut conn = self.pool.acquire().await?;
        machines_by_roles(&mut conn, roles).await
    }

    /// Boot IPv4 addresses of the role's machines, sorted as text.
    pub async fn get_role_ip_list(&self, role: ScheduleRole) -> SchedulerResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        role_ip_list(&mut conn, role).await
    }

    /// Discovered machines without any role, ordered by MAC.
    pub async fn get_available_machines(&self) -> SchedulerResult<Vec<ScheduledMachine>> {
        let mut conn = self.pool.acquire().await?;
        available_machines(&mut conn).await
    }
}

// =============================================================================
// Queries shared with the promotion policy
// =============================================================================

pub(super) async fn machine_exists(
    conn: &mut SqliteConnection,
    mac: &MacAddress,
) -> SchedulerResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM machines WHERE mac = ?1")
        .bind(mac.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

/// Insert missing `(mac, role)` pairs, appending them after existing roles.
/// Returns how many were new.
pub(super) async fn insert_roles(
    conn: &mut SqliteConnection,
    mac: &MacAddress,
    roles: &[ScheduleRole],
    now: i64,
) -> SchedulerResult<u64> {
    let mut added = 0;
    for role in roles {
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (mac, role, position, created_at)
            VALUES (
                ?1,
                ?2,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM schedules WHERE mac = ?1),
                ?3
            )
            ON CONFLICT(mac, role) DO NOTHING
            "#,
        )
        .bind(mac.to_string())
        .bind(role.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        added += result.rows_affected();
    }
    Ok(added)
}

pub(super) async fn roles_by_mac(
    conn: &mut SqliteConnection,
    mac: &MacAddress,
) -> SchedulerResult<Vec<ScheduleRole>> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT role FROM schedules WHERE mac = ?1 ORDER BY position")
            .bind(mac.to_string())
            .fetch_all(&mut *conn)
            .await?;
    names
        .iter()
        .map(|name| {
            ScheduleRole::parse(name)
                .map_err(|e| SchedulerError::from(DbError::corrupt("schedules", e)))
        })
        .collect()
}

pub(super) async fn all_schedules(
    conn: &mut SqliteConnection,
) -> SchedulerResult<BTreeMap<MacAddress, Vec<ScheduleRole>>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT mac, role FROM schedules ORDER BY mac, position")
            .fetch_all(&mut *conn)
            .await?;

    let mut schedules: BTreeMap<MacAddress, Vec<ScheduleRole>> = BTreeMap::new();
    for (mac, role) in rows {
        let mac = MacAddress::parse(&mac).map_err(|e| DbError::corrupt("schedules", e))?;
        let role = ScheduleRole::parse(&role).map_err(|e| DbError::corrupt("schedules", e))?;
        schedules.entry(mac).or_default().push(role);
    }
    Ok(schedules)
}

pub(super) async fn machines_by_roles(
    conn: &mut SqliteConnection,
    roles: &[ScheduleRole],
) -> SchedulerResult<Vec<ScheduledMachine>> {
    let mut wanted: Vec<ScheduleRole> = roles.to_vec();
    wanted.sort();
    wanted.dedup();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_as::<_, BootRow>(
        r#"
        SELECT i.machine_mac, i.name, i.mac, i.ipv4, i.cidrv4, i.netmask, i.gateway, i.fqdn,
               i.as_boot, m.created_at
        FROM machines m
        JOIN machine_interfaces i ON i.machine_mac = m.mac AND i.as_boot = 1
        WHERE (
            SELECT COUNT(*) FROM schedules s
            WHERE s.mac = m.mac AND s.role IN (SELECT value FROM json_each(?1))
        ) = ?2
        ORDER BY m.mac
        "#,
    )
    .bind(serde_json::to_string(&wanted).map_err(DbError::from)?)
    .bind(wanted.len() as i64)
    .fetch_all(&mut *conn)
    .await?;

    enrich(conn, rows).await
}

pub(super) async fn count_machines_by_roles(
    conn: &mut SqliteConnection,
    roles: &[ScheduleRole],
) -> SchedulerResult<usize> {
    let mut wanted: Vec<ScheduleRole> = roles.to_vec();
    wanted.sort();
    wanted.dedup();
    if wanted.is_empty() {
        return Ok(0);
    }

    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT s.mac FROM schedules s
            WHERE s.role IN (SELECT value FROM json_each(?1))
            GROUP BY s.mac
            HAVING COUNT(*) = ?2
        )
        "#,
    )
    .bind(serde_json::to_string(&wanted).map_err(DbError::from)?)
    .bind(wanted.len() as i64)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count.max(0) as usize)
}

pub(super) async fn available_machines(
    conn: &mut SqliteConnection,
) -> SchedulerResult<Vec<ScheduledMachine>> {
    let rows = sqlx::query_as::<_, BootRow>(
        r#"
        SELECT i.machine_mac, i.name, i.mac, i.ipv4, i.cidrv4, i.netmask, i.gateway, i.fqdn,
               i.as_boot, m.created_at
        FROM machines m
        JOIN machine_interfaces i ON i.machine_mac = m.mac AND i.as_boot = 1
        WHERE NOT EXISTS (SELECT 1 FROM schedules s WHERE s.mac = m.mac)
        ORDER BY m.mac
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    enrich(conn, rows).await
}

pub(super) async fn role_ip_list(
    conn: &mut SqliteConnection,
    role: ScheduleRole,
) -> SchedulerResult<Vec<String>> {
    let ips: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT i.ipv4
        FROM schedules s
        JOIN machine_interfaces i ON i.machine_mac = s.mac AND i.as_boot = 1
        WHERE s.role = ?1
        "#,
    )
    .bind(role.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(sort_ip_list(&ips))
}

/// Attach ordered roles and disks to boot-interface rows.
async fn enrich(
    conn: &mut SqliteConnection,
    rows: Vec<BootRow>,
) -> SchedulerResult<Vec<ScheduledMachine>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let macs: Vec<&str> = rows.iter().map(|r| r.interface.machine_mac.as_str()).collect();
    let macs_json = serde_json::to_string(&macs).map_err(DbError::from)?;

    let role_rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT mac, role FROM schedules
        WHERE mac IN (SELECT value FROM json_each(?1))
        ORDER BY mac, position
        "#,
    )
    .bind(&macs_json)
    .fetch_all(&mut *conn)
    .await?;
    let mut roles: HashMap<String, Vec<String>> = HashMap::new();
    for (mac, role) in role_rows {
        roles.entry(mac).or_default().push(role);
    }

    let disk_rows = sqlx::query_as::<_, DiskRow>(
        r#"
        SELECT machine_mac, path, size_bytes FROM machine_disks
        WHERE machine_mac IN (SELECT value FROM json_each(?1))
        ORDER BY machine_mac, position
        "#,
    )
    .bind(&macs_json)
    .fetch_all(&mut *conn)
    .await?;
    let mut disks: HashMap<String, Vec<_>> = HashMap::new();
    for row in disk_rows {
        let key = row.machine_mac.clone();
        disks.entry(key).or_default().push(row.into_disk());
    }

    let mut machines = Vec::with_capacity(rows.len());
    for row in rows {
        let machine_mac = row.interface.machine_mac.clone();
        let interface = row.interface.into_interface()?;
        machines.push(ScheduledMachine {
            mac: interface.mac,
            name: interface.name,
            ipv4: interface.ipv4,
            cidrv4: interface.cidrv4,
            netmask: interface.netmask,
            gateway: interface.gateway,
            as_boot: interface.as_boot,
            fqdn: interface.fqdn,
            roles: roles.remove(&machine_mac).unwrap_or_default().join(","),
            disks: disks.remove(&machine_mac).unwrap_or_default(),
            created_date: from_millis(row.created_at),
        });
    }
    Ok(machines)
}

#[derive(Debug)]
struct BootRow {
    interface: InterfaceRow,
    created_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for BootRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            interface: InterfaceRow::from_row(row)?,
            created_at: row.try_get("created_at")?,
        })
    }
}
