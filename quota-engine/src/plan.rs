use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::period::PeriodKind;
use crate::principal::Principal;

/// Canonical plan identifier. Plans are only ever looked up by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub u64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub request_limit_per_period: u64,
    pub concurrency_limit: u32,
    pub period: PeriodKind,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// What to do with a principal whose plan is missing, unknown or inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoPlanPolicy {
    Deny,
    DefaultPlan(PlanId),
}

/// Plan definitions known to the engine, keyed by id.
///
/// Cheap to clone; clones share the same underlying map so plan upserts are
/// visible to every request immediately.
#[derive(Clone)]
pub struct PlanStore {
    plans: Arc<DashMap<PlanId, Arc<Plan>>>,
    no_plan: NoPlanPolicy,
}

impl PlanStore {
    pub fn new(no_plan: NoPlanPolicy) -> Self {
        Self {
            plans: Arc::new(DashMap::new()),
            no_plan,
        }
    }

    /// Add or replace a plan definition
    pub fn upsert_plan(&self, plan: Plan) {
        self.plans.insert(plan.id, Arc::new(plan));
    }

    pub fn load_plans(&self, plans: impl IntoIterator<Item = Plan>) {
        for plan in plans {
            self.upsert_plan(plan);
        }
    }

    pub fn get_plan(&self, id: PlanId) -> Option<Arc<Plan>> {
        self.plans.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve the plan that governs `principal`.
    ///
    /// An assigned plan that exists and is active always wins. Otherwise the
    /// configured [`NoPlanPolicy`] decides between a `NoPlanAssigned` error and
    /// an explicit default plan.
    pub fn resolve(&self, principal: &Principal) -> Result<Arc<Plan>, Error> {
        if let Some(plan) = principal.plan_id.and_then(|id| self.get_plan(id)) {
            if plan.is_active {
                return Ok(plan);
            }
        }
        match self.no_plan {
            NoPlanPolicy::Deny => Err(Error::new(ErrorDetails::NoPlanAssigned {
                user_id: principal.user_id,
                plan_id: principal.plan_id,
            })),
            NoPlanPolicy::DefaultPlan(default_id) => match self.get_plan(default_id) {
                Some(plan) => {
                    tracing::info!(
                        user_id = %principal.user_id,
                        assigned_plan = ?principal.plan_id,
                        default_plan = %default_id,
                        "Falling back to the default plan"
                    );
                    Ok(plan)
                }
                None => Err(Error::new(ErrorDetails::Config {
                    message: format!("Default plan {default_id} is not defined"),
                })),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::UserId;
    use tracing_test::traced_test;

    fn plan(id: u64, limit: u64) -> Plan {
        Plan {
            id: PlanId(id),
            name: format!("plan-{id}"),
            request_limit_per_period: limit,
            concurrency_limit: 2,
            period: PeriodKind::Daily,
            is_active: true,
        }
    }

    fn principal(plan_id: Option<u64>) -> Principal {
        Principal {
            user_id: UserId(11),
            is_active: true,
            plan_id: plan_id.map(PlanId),
            is_admin: false,
        }
    }

    #[test]
    fn test_plan_store() {
        let store = PlanStore::new(NoPlanPolicy::Deny);
        store.load_plans([plan(1, 100), plan(2, 1000)]);
        assert_eq!(store.resolve(&principal(Some(2))).unwrap().request_limit_per_period, 1000);

        let shared = store.clone();
        shared.upsert_plan(plan(2, 5000));
        assert_eq!(store.get_plan(PlanId(2)).unwrap().request_limit_per_period, 5000);

        let err = store.resolve(&principal(Some(7))).unwrap_err();
        assert_eq!(
            err.get_details(),
            &ErrorDetails::NoPlanAssigned {
                user_id: UserId(11),
                plan_id: Some(PlanId(7)),
            }
        );
    }

    #[test]
    fn test_inactive_plan_is_not_used() {
        let store = PlanStore::new(NoPlanPolicy::Deny);
        store.upsert_plan(Plan {
            is_active: false,
            ..plan(5, 10)
        });
        assert!(store.resolve(&principal(Some(5))).is_err());
    }

    #[test]
    #[traced_test]
    fn test_default_plan_policy() {
        let store = PlanStore::new(NoPlanPolicy::DefaultPlan(PlanId(1)));
        store.upsert_plan(plan(1, 50));
        let resolved = store.resolve(&principal(None)).unwrap();
        assert_eq!(resolved.id, PlanId(1));
        assert!(logs_contain("Falling back to the default plan"));

        let missing_default = PlanStore::new(NoPlanPolicy::DefaultPlan(PlanId(9)));
        let err = missing_default.resolve(&principal(None)).unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_no_plan_policy_deserialization() {
        #[derive(Deserialize)]
        struct Wrapper {
            no_plan: NoPlanPolicy,
        }
        let deny: Wrapper = toml::from_str(r#"no_plan = "deny""#).unwrap();
        assert_eq!(deny.no_plan, NoPlanPolicy::Deny);
        let default: Wrapper = toml::from_str("no_plan = { default_plan = 3 }").unwrap();
        assert_eq!(default.no_plan, NoPlanPolicy::DefaultPlan(PlanId(3)));
    }
}
