//! Fleet inventory: the accounts, organizational units and enabled regions a
//! package can deploy to.
//!
//! Discovery itself is an external concern; this module models the inventory
//! document, its cache object, and the scoping queries the planner needs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleetform_storage::ObjectStore;

use crate::patterns::matches_any_full;
use crate::Result;

/// Name of the inventory cache object under the configured prefix.
pub const FLEET_CACHE_OBJECT: &str = "orga.json";

/// Region pattern that expands to every region enabled in an account.
pub const ALL_ENABLED_REGIONS: &str = "ALL_ENABLED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags", default)]
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "EnabledRegions", default)]
    pub enabled_regions: Vec<String>,
    /// Ids of the organizational units on the path from the root to the
    /// account, nearest parent last.
    #[serde(rename = "ParentOUs", default)]
    pub parent_ous: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgUnitInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags", default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetInventory {
    #[serde(rename = "Accounts", default)]
    accounts: BTreeMap<String, AccountInfo>,
    #[serde(rename = "OrganizationalUnits", default)]
    org_units: BTreeMap<String, OrgUnitInfo>,
}

impl FleetInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&mut self, account: AccountInfo) {
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn add_org_unit(&mut self, org_unit: OrgUnitInfo) {
        self.org_units.insert(org_unit.id.clone(), org_unit);
    }

    pub fn all_accounts(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    pub fn accounts_by_id(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| self.accounts.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Accounts whose name matches one of the `*`-glob patterns. The whole
    /// name must match, so a literal pattern selects exactly one name.
    pub fn accounts_by_name(&self, patterns: &[String]) -> Vec<String> {
        self.accounts
            .values()
            .filter(|account| matches_any_full(&account.name, patterns))
            .map(|account| account.id.clone())
            .collect()
    }

    /// Accounts carrying at least one of the `Key=Value` tags.
    pub fn accounts_by_tag(&self, tags: &[String]) -> Vec<String> {
        self.accounts
            .values()
            .filter(|account| has_any_tag(&account.tags, tags))
            .map(|account| account.id.clone())
            .collect()
    }

    /// Accounts that sit under one of the organizational units.
    pub fn accounts_by_ou(&self, ou_ids: &[String]) -> Vec<String> {
        self.accounts
            .values()
            .filter(|account| account.parent_ous.iter().any(|ou| ou_ids.contains(ou)))
            .map(|account| account.id.clone())
            .collect()
    }

    /// Accounts whose ancestor organizational units carry at least one of the
    /// `Key=Value` tags.
    pub fn accounts_by_ou_tag(&self, tags: &[String]) -> Vec<String> {
        self.accounts
            .values()
            .filter(|account| {
                account.parent_ous.iter().any(|ou_id| {
                    self.org_units
                        .get(ou_id)
                        .is_some_and(|ou| has_any_tag(&ou.tags, tags))
                })
            })
            .map(|account| account.id.clone())
            .collect()
    }

    /// Expand region patterns for an account. `ALL_ENABLED` expands to the
    /// account's enabled regions; other entries are taken as-is.
    pub fn account_regions(&self, account_id: &str, patterns: &[String]) -> Vec<String> {
        let Some(account) = self.accounts.get(account_id) else {
            return Vec::new();
        };
        let mut regions = BTreeSet::new();
        for pattern in patterns {
            if pattern == ALL_ENABLED_REGIONS {
                regions.extend(account.enabled_regions.iter().cloned());
            } else {
                regions.insert(pattern.clone());
            }
        }
        regions.into_iter().collect()
    }

    pub fn all_enabled_regions(&self) -> Vec<String> {
        let mut regions = BTreeSet::new();
        for account in self.accounts.values() {
            regions.extend(account.enabled_regions.iter().cloned());
        }
        regions.into_iter().collect()
    }

    pub fn account_name(&self, account_id: &str) -> Option<String> {
        self.accounts.get(account_id).map(|a| a.name.clone())
    }

    /// True if the account still exists and has the region enabled.
    pub fn account_region_exists(&self, account_id: &str, region: &str) -> bool {
        self.accounts
            .get(account_id)
            .is_some_and(|account| account.enabled_regions.iter().any(|r| r == region))
    }

    pub fn export(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("inventory serializes to JSON")
    }

    /// Load the cached inventory document, if one exists.
    pub async fn load_cached(object_store: &Arc<dyn ObjectStore>) -> Result<Option<Self>> {
        match object_store.get(FLEET_CACHE_OBJECT).await? {
            Some(bytes) => {
                let inventory: FleetInventory = serde_json::from_slice(&bytes)?;
                debug!(
                    "Loaded the fleet inventory cache ({} accounts)",
                    inventory.accounts.len()
                );
                Ok(Some(inventory))
            }
            None => Ok(None),
        }
    }

    pub async fn save_cache(&self, object_store: &Arc<dyn ObjectStore>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        object_store.put(FLEET_CACHE_OBJECT, bytes).await?;
        Ok(())
    }
}

/// True if `tags` contains at least one of the `Key=Value` selectors.
fn has_any_tag(tags: &BTreeMap<String, String>, selectors: &[String]) -> bool {
    selectors.iter().any(|selector| {
        selector
            .split_once('=')
            .is_some_and(|(key, value)| tags.get(key).map(String::as_str) == Some(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> FleetInventory {
        let mut fleet = FleetInventory::new();
        fleet.add_org_unit(OrgUnitInfo {
            id: "ou-root".to_string(),
            name: "Root".to_string(),
            tags: BTreeMap::new(),
        });
        fleet.add_org_unit(OrgUnitInfo {
            id: "ou-prod".to_string(),
            name: "Production".to_string(),
            tags: [("Stage".to_string(), "prod".to_string())].into(),
        });
        fleet.add_account(AccountInfo {
            id: "111111111111".to_string(),
            name: "prod-main".to_string(),
            tags: [("Stage".to_string(), "prod".to_string())].into(),
            enabled_regions: vec!["eu-west-1".to_string(), "us-east-1".to_string()],
            parent_ous: vec!["ou-root".to_string(), "ou-prod".to_string()],
        });
        fleet.add_account(AccountInfo {
            id: "222222222222".to_string(),
            name: "dev-sandbox".to_string(),
            tags: [("Stage".to_string(), "dev".to_string())].into(),
            enabled_regions: vec!["eu-west-1".to_string()],
            parent_ous: vec!["ou-root".to_string()],
        });
        fleet
    }

    #[test]
    fn test_accounts_by_name_glob() {
        let fleet = inventory();
        let ids = fleet.accounts_by_name(&["prod-*".to_string()]);
        assert_eq!(ids, vec!["111111111111".to_string()]);
    }

    #[test]
    fn test_accounts_by_name_literal_is_an_exact_match() {
        let mut fleet = inventory();
        fleet.add_account(AccountInfo {
            id: "333333333333".to_string(),
            name: "prod-main-backup".to_string(),
            tags: BTreeMap::new(),
            enabled_regions: vec!["eu-west-1".to_string()],
            parent_ous: vec!["ou-root".to_string()],
        });
        // A literal pattern must not select names that merely start with it.
        let ids = fleet.accounts_by_name(&["prod-main".to_string()]);
        assert_eq!(ids, vec!["111111111111".to_string()]);
        let ids = fleet.accounts_by_name(&["prod-main*".to_string()]);
        assert_eq!(
            ids,
            vec!["111111111111".to_string(), "333333333333".to_string()]
        );
    }

    #[test]
    fn test_accounts_by_tag() {
        let fleet = inventory();
        let ids = fleet.accounts_by_tag(&["Stage=dev".to_string()]);
        assert_eq!(ids, vec!["222222222222".to_string()]);
        assert!(fleet.accounts_by_tag(&["Stage=qa".to_string()]).is_empty());
    }

    #[test]
    fn test_accounts_by_ou_and_ou_tag() {
        let fleet = inventory();
        assert_eq!(fleet.accounts_by_ou(&["ou-prod".to_string()]).len(), 1);
        assert_eq!(fleet.accounts_by_ou(&["ou-root".to_string()]).len(), 2);
        assert_eq!(
            fleet.accounts_by_ou_tag(&["Stage=prod".to_string()]),
            vec!["111111111111".to_string()]
        );
    }

    #[test]
    fn test_account_regions_all_enabled() {
        let fleet = inventory();
        let regions =
            fleet.account_regions("111111111111", &[ALL_ENABLED_REGIONS.to_string()]);
        assert_eq!(regions, vec!["eu-west-1".to_string(), "us-east-1".to_string()]);
        let explicit = fleet.account_regions("111111111111", &["us-east-1".to_string()]);
        assert_eq!(explicit, vec!["us-east-1".to_string()]);
    }

    #[test]
    fn test_account_region_exists() {
        let fleet = inventory();
        assert!(fleet.account_region_exists("222222222222", "eu-west-1"));
        assert!(!fleet.account_region_exists("222222222222", "us-east-1"));
        assert!(!fleet.account_region_exists("333333333333", "eu-west-1"));
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(fleetform_storage::LocalObjectStore::new(dir.path()));
        assert!(FleetInventory::load_cached(&object_store)
            .await
            .unwrap()
            .is_none());

        let fleet = inventory();
        fleet.save_cache(&object_store).await.unwrap();
        let loaded = FleetInventory::load_cached(&object_store).await.unwrap();
        assert_eq!(loaded, Some(fleet));
    }
}
