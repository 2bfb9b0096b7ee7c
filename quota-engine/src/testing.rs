#![cfg(test)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use secrecy::SecretString;

use crate::config::Config;
use crate::counter::{CounterStore, UsageCounter};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::period::{Period, PeriodKind};
use crate::plan::{Plan, PlanId};
use crate::principal::{Auth, Claims, Principal, UserId};

pub const TEST_JWT_SECRET: &str = "unit-test-signing-secret";

pub fn test_auth() -> Auth {
    Auth::new(&SecretString::from(TEST_JWT_SECRET.to_string()), None)
}

/// Claims for [`mint_token`]; build with struct-update syntax over [`TestToken::user`].
pub struct TestToken {
    pub user_id: u64,
    pub plan_id: Option<PlanId>,
    pub admin: bool,
    pub active: bool,
}

impl TestToken {
    pub fn user(user_id: u64) -> Self {
        Self {
            user_id,
            plan_id: None,
            admin: false,
            active: true,
        }
    }
}

pub fn mint_token(token: &TestToken) -> String {
    let claims = Claims {
        sub: token.user_id.to_string(),
        exp: (Utc::now().timestamp() + 3600).unsigned_abs(),
        active: token.active,
        plan_id: token.plan_id,
        admin: token.admin,
        iss: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn test_plan(id: u64, limit: u64, concurrency: u32, period: PeriodKind) -> Plan {
    Plan {
        id: PlanId(id),
        name: format!("plan-{id}"),
        request_limit_per_period: limit,
        concurrency_limit: concurrency,
        period,
        is_active: true,
    }
}

pub fn principal(user_id: u64, plan_id: Option<u64>) -> Principal {
    Principal {
        user_id: UserId(user_id),
        is_active: true,
        plan_id: plan_id.map(PlanId),
        is_admin: false,
    }
}

/// App state over in-memory backends, authenticated with [`test_auth`].
pub async fn get_unit_test_app_state_data(config: Arc<Config>) -> AppStateData {
    AppStateData::new_with_auth(config, test_auth(), None)
        .await
        .unwrap()
}

/// A counter store that is always unreachable.
pub struct FailingCounterStore;

fn unavailable() -> Error {
    Error::new_without_logging(ErrorDetails::StoreUnavailable {
        message: "connection refused".to_string(),
    })
}

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn get_or_create(
        &self,
        _principal_id: UserId,
        _period: &Period,
    ) -> Result<UsageCounter, Error> {
        Err(unavailable())
    }

    async fn increment(&self, _principal_id: UserId, _period: &Period) -> Result<u64, Error> {
        Err(unavailable())
    }

    async fn reset(&self, _principal_id: UserId, _period_key: &str) -> Result<bool, Error> {
        Err(unavailable())
    }

    async fn acquire_slot(&self, _principal_id: UserId) -> Result<u32, Error> {
        Err(unavailable())
    }

    async fn release_slot(&self, _principal_id: UserId) -> Result<(), Error> {
        Err(unavailable())
    }

    async fn in_flight(&self, _principal_id: UserId) -> Result<u32, Error> {
        Err(unavailable())
    }

    async fn list_counters(&self) -> Result<Vec<UsageCounter>, Error> {
        Err(unavailable())
    }

    async fn prune_expired(&self, _now: DateTime<Utc>) -> Result<usize, Error> {
        Err(unavailable())
    }

    async fn ping(&self) -> Result<(), Error> {
        Err(unavailable())
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
