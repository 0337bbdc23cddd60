//! HR directory synchronization.
//!
//! Pulls the employee list and the department hierarchy, rebuilds each
//! employee's root-to-leaf path, diffs against the stored directory, and
//! applies added / removed / department-changed transitions through the
//! resolver. Runs are serial under a process-local advisory lock; a
//! gateway failure aborts the tick and the next tick retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use tally_common::config::HrSyncConfig;
use tally_common::{EmployeeNumber, TallyError, TallyResult};
use tally_gateway::Gateway;

use crate::resolver::{IdentityMap, PermissionResolver};
use crate::store::PermissionStore;
use crate::types::EmployeeDepartment;

/// Header carrying the 32-byte shared feed key.
const SYNC_KEY_HEADER: &str = "X-Sync-Key";

/// Department walk depth guard against parent-id cycles.
const MAX_PATH_DEPTH: usize = 32;

/// Employee record from the HR feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HrEmployee {
    pub employee_number: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub department_id: i64,
}

/// Department record from the HR feed. `parent_id` 0 marks a root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HrDepartment {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub status: i32,
}

/// Pull-based HR feed.
#[trait_variant::make(HrFeed: Send)]
pub trait LocalHrFeed {
    /// Full employee list.
    async fn fetch_employees(&self) -> TallyResult<Vec<HrEmployee>>;

    /// Full department hierarchy.
    async fn fetch_departments(&self) -> TallyResult<Vec<HrDepartment>>;
}

/// HR feed over HTTP, authenticated by the shared key.
pub struct HttpHrFeed {
    http: reqwest::Client,
    employees_url: String,
    departments_url: String,
    shared_key: String,
}

impl HttpHrFeed {
    /// Build a feed client from configuration.
    pub fn new(config: &HrSyncConfig) -> TallyResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TallyError::Configuration(format!("hr feed client: {e}")))?;
        Ok(Self {
            http,
            employees_url: config.employees_url.clone(),
            departments_url: config.departments_url.clone(),
            shared_key: config.shared_key.expose_secret().clone(),
        })
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str) -> TallyResult<Vec<T>> {
        let response = self
            .http
            .get(url)
            .header(SYNC_KEY_HEADER, &self.shared_key)
            .send()
            .await
            .map_err(|e| TallyError::GatewayTransient(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TallyError::GatewayTransient(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TallyError::GatewayPermanent(format!("{url}: HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| TallyError::GatewayTransient(format!("{url}: decode: {e}")))
    }
}

impl HrFeed for HttpHrFeed {
    async fn fetch_employees(&self) -> TallyResult<Vec<HrEmployee>> {
        self.fetch(&self.employees_url).await
    }

    async fn fetch_departments(&self) -> TallyResult<Vec<HrDepartment>> {
        self.fetch(&self.departments_url).await
    }
}

/// Build each department's root-to-leaf name path by walking
/// `parent_id`. Departments caught in a cycle resolve to an empty path
/// and are logged.
pub fn department_paths(departments: &[HrDepartment]) -> HashMap<i64, Vec<String>> {
    let by_id: HashMap<i64, &HrDepartment> =
        departments.iter().map(|d| (d.id, d)).collect();

    let mut paths = HashMap::with_capacity(departments.len());
    for dept in departments {
        let mut path = Vec::new();
        let mut cursor = Some(dept);
        while let Some(current) = cursor {
            if path.len() >= MAX_PATH_DEPTH {
                warn!(department = current.id, "department hierarchy cycle detected");
                path.clear();
                break;
            }
            path.push(current.name.clone());
            cursor = if current.parent_id == 0 {
                None
            } else {
                by_id.get(&current.parent_id).copied()
            };
        }
        path.reverse();
        paths.insert(dept.id, path);
    }
    paths
}

/// Outcome counters for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: u64,
    pub removed: u64,
    pub department_changed: u64,
}

/// Drives the periodic HR synchronization.
pub struct HrSyncDriver<S, G, M, F> {
    resolver: Arc<PermissionResolver<S, G, M>>,
    store: Arc<S>,
    feed: F,
    lock: tokio::sync::Mutex<()>,
    interval: Duration,
}

impl<S, G, M, F> HrSyncDriver<S, G, M, F>
where
    S: PermissionStore + Sync,
    G: Gateway + Send + Sync,
    M: IdentityMap + Sync,
    F: HrFeed + Sync,
{
    /// Create a driver.
    pub fn new(
        resolver: Arc<PermissionResolver<S, G, M>>,
        store: Arc<S>,
        feed: F,
        interval: Duration,
    ) -> Self {
        Self {
            resolver,
            store,
            feed,
            lock: tokio::sync::Mutex::new(()),
            interval,
        }
    }

    /// One synchronization run. Returns `None` when a previous run still
    /// holds the advisory lock.
    #[instrument(name = "hr.sync_once", skip_all)]
    pub async fn sync_once(&self) -> TallyResult<Option<SyncReport>> {
        let Ok(_guard) = self.lock.try_lock() else {
            warn!("previous hr sync still running, skipping tick");
            return Ok(None);
        };

        let employees = self.feed.fetch_employees().await?;
        let departments = self.feed.fetch_departments().await?;
        let paths = department_paths(&departments);

        let mut desired: HashMap<EmployeeNumber, EmployeeDepartment> = HashMap::new();
        for employee in &employees {
            let path = paths
                .get(&employee.department_id)
                .cloned()
                .unwrap_or_default();
            let number = EmployeeNumber::from(employee.employee_number.as_str());
            desired.insert(
                number.clone(),
                EmployeeDepartment::new(number, employee.username.clone(), path),
            );
        }

        let current = self.store.list_employees().await?;
        let mut report = SyncReport::default();

        for entry in &current {
            if !desired.contains_key(&entry.employee_number) {
                self.resolver.remove_employee(&entry.employee_number).await?;
                report.removed += 1;
            }
        }

        let current_by_number: HashMap<&EmployeeNumber, &EmployeeDepartment> =
            current.iter().map(|e| (&e.employee_number, e)).collect();
        for (number, entry) in &desired {
            match current_by_number.get(number) {
                None => {
                    self.resolver.add_employee(entry).await?;
                    report.added += 1;
                }
                Some(existing) if existing.dept_path != entry.dept_path => {
                    self.resolver.handle_department_change(entry).await?;
                    report.department_changed += 1;
                }
                Some(existing) if existing.username != entry.username => {
                    self.store.upsert_employee(entry).await?;
                }
                Some(_) => {}
            }
        }

        info!(?report, "hr sync complete");
        Ok(Some(report))
    }

    /// Run the sync loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("hr sync stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        warn!(error = %err, "hr sync tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MemoryIdentityMap;
    use crate::store::MemoryPermissionStore;
    use crate::types::TargetType;
    use std::sync::RwLock;
    use tally_gateway::MemoryGateway;

    struct StaticFeed {
        employees: RwLock<Vec<HrEmployee>>,
        departments: RwLock<Vec<HrDepartment>>,
    }

    impl StaticFeed {
        fn new(employees: Vec<HrEmployee>, departments: Vec<HrDepartment>) -> Self {
            Self {
                employees: RwLock::new(employees),
                departments: RwLock::new(departments),
            }
        }

        fn set_employees(&self, employees: Vec<HrEmployee>) {
            *self.employees.write().unwrap() = employees;
        }
    }

    impl HrFeed for &StaticFeed {
        async fn fetch_employees(&self) -> TallyResult<Vec<HrEmployee>> {
            Ok(self.employees.read().unwrap().clone())
        }

        async fn fetch_departments(&self) -> TallyResult<Vec<HrDepartment>> {
            Ok(self.departments.read().unwrap().clone())
        }
    }

    fn employee(number: &str, department_id: i64) -> HrEmployee {
        HrEmployee {
            employee_number: number.to_string(),
            username: number.to_lowercase(),
            email: String::new(),
            phone: String::new(),
            department_id,
        }
    }

    fn departments() -> Vec<HrDepartment> {
        vec![
            HrDepartment {
                id: 1,
                parent_id: 0,
                name: "Company".to_string(),
                level: 1,
                status: 1,
            },
            HrDepartment {
                id: 2,
                parent_id: 1,
                name: "R&D".to_string(),
                level: 2,
                status: 1,
            },
            HrDepartment {
                id: 3,
                parent_id: 1,
                name: "Sales".to_string(),
                level: 2,
                status: 1,
            },
        ]
    }

    fn driver(
        feed: &StaticFeed,
    ) -> (
        Arc<MemoryPermissionStore>,
        Arc<MemoryGateway>,
        HrSyncDriver<MemoryPermissionStore, MemoryGateway, MemoryIdentityMap, &StaticFeed>,
    ) {
        let store = Arc::new(MemoryPermissionStore::new());
        let gateway = Arc::new(MemoryGateway::new());
        let resolver = Arc::new(PermissionResolver::new(
            store.clone(),
            gateway.clone(),
            Arc::new(MemoryIdentityMap::new()),
            true,
        ));
        let sync = HrSyncDriver::new(resolver, store.clone(), feed, Duration::from_secs(3600));
        (store, gateway, sync)
    }

    #[test]
    fn test_department_paths_walk_to_root() {
        let paths = department_paths(&departments());
        assert_eq!(paths[&1], vec!["Company"]);
        assert_eq!(paths[&2], vec!["Company", "R&D"]);
    }

    #[test]
    fn test_department_paths_survive_cycles() {
        let cyclic = vec![
            HrDepartment {
                id: 1,
                parent_id: 2,
                name: "A".to_string(),
                level: 1,
                status: 1,
            },
            HrDepartment {
                id: 2,
                parent_id: 1,
                name: "B".to_string(),
                level: 1,
                status: 1,
            },
        ];
        let paths = department_paths(&cyclic);
        assert!(paths[&1].is_empty());
        assert!(paths[&2].is_empty());
    }

    #[tokio::test]
    async fn test_sync_adds_and_removes() {
        let feed = StaticFeed::new(vec![employee("E1", 2)], departments());
        let (store, gateway, sync) = driver(&feed);

        let report = sync.sync_once().await.unwrap().unwrap();
        assert_eq!(report.added, 1);
        let stored = store
            .get_employee(&EmployeeNumber::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.dept_path, vec!["Company", "R&D"]);

        // Employee disappears from the feed.
        feed.set_employees(vec![]);
        let report = sync.sync_once().await.unwrap().unwrap();
        assert_eq!(report.removed, 1);
        assert!(store
            .get_employee(&EmployeeNumber::from("E1"))
            .await
            .unwrap()
            .is_none());
        assert!(gateway.models(&EmployeeNumber::from("E1")).is_empty());
    }

    #[tokio::test]
    async fn test_department_change_clears_personal_whitelist() {
        // S6: employee with a personal whitelist moves departments.
        let feed = StaticFeed::new(vec![employee("E1", 2)], departments());
        let (store, gateway, sync) = driver(&feed);
        sync.sync_once().await.unwrap();

        store
            .upsert_whitelist(TargetType::Department, "Sales", &["m-sales".to_string()])
            .await
            .unwrap();
        store
            .upsert_whitelist(TargetType::User, "E1", &["m-personal".to_string()])
            .await
            .unwrap();
        let calls_before = gateway.set_models_calls().len();

        feed.set_employees(vec![employee("E1", 3)]);
        let report = sync.sync_once().await.unwrap().unwrap();
        assert_eq!(report.department_changed, 1);

        let emp = EmployeeNumber::from("E1");
        assert!(store
            .get_whitelist(TargetType::User, "E1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.get_effective_models(&emp).await.unwrap(),
            Some(vec!["m-sales".to_string()])
        );
        // Exactly one SetModels call for the change.
        assert_eq!(gateway.set_models_calls().len(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_unchanged_sync_is_quiet() {
        let feed = StaticFeed::new(vec![employee("E1", 2)], departments());
        let (_, gateway, sync) = driver(&feed);
        sync.sync_once().await.unwrap();
        let calls = gateway.set_models_calls().len();

        let report = sync.sync_once().await.unwrap().unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(gateway.set_models_calls().len(), calls);
    }
}
