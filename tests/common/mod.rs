//! Shared test utilities

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use switchyard::{
    Account, Backend, BackendModule, BackendStorage, CapBank, Capability, Config, Orchestrator,
    ParamSpec, Params, Transaction,
};

/// Password accepted by [`TestBankModule`]
pub const PASSWORD: &str = "hunter2";

/// Bank module whose listing fails unless the password is [`PASSWORD`]
pub struct TestBankModule;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("login", "Customer number"),
    ParamSpec::required("password", "Online banking password").secret(),
];

impl BackendModule for TestBankModule {
    fn name(&self) -> &str {
        "testbank"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Bank used by integration tests"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Bank]
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn create_instance(
        &self,
        params: Params,
        storage: BackendStorage,
    ) -> anyhow::Result<Box<dyn Backend>> {
        Ok(Box::new(TestBank {
            login: params.get("login").unwrap_or_default().to_string(),
            password: params
                .secret("password")
                .unwrap_or_else(|| SecretString::from(String::new())),
            storage,
        }))
    }
}

struct TestBank {
    login: String,
    password: SecretString,
    storage: BackendStorage,
}

#[async_trait]
impl Backend for TestBank {
    async fn deinit(&mut self) -> anyhow::Result<()> {
        let sessions: u64 = self.storage.get_or("sessions", 0);
        self.storage.set("sessions", &(sessions + 1))?;
        Ok(())
    }

    fn as_bank(&mut self) -> Option<&mut dyn CapBank> {
        Some(self)
    }
}

impl TestBank {
    fn accounts(&self) -> Vec<Account> {
        ["checking", "savings"]
            .into_iter()
            .map(|kind| Account {
                id: format!("{}-{kind}", self.login),
                label: kind.to_string(),
                balance: 1_000,
                currency: "EUR".to_string(),
            })
            .collect()
    }

    fn check_login(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.password.expose_secret() == PASSWORD,
            "invalid credentials for {}",
            self.login
        );
        Ok(())
    }
}

#[async_trait]
impl CapBank for TestBank {
    fn iter_accounts(&mut self) -> BoxStream<'_, anyhow::Result<Account>> {
        match self.check_login() {
            Ok(()) => futures::stream::iter(self.accounts().into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn get_account(&mut self, id: &str) -> anyhow::Result<Option<Account>> {
        self.check_login()?;
        Ok(self.accounts().into_iter().find(|account| account.id == id))
    }

    fn iter_history<'a>(
        &'a mut self,
        account_id: &'a str,
    ) -> BoxStream<'a, anyhow::Result<Transaction>> {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        futures::stream::iter([Ok(Transaction {
            id: format!("{account_id}-1"),
            date,
            label: "Rent".to_string(),
            amount: -80_000,
        })])
        .boxed()
    }
}

/// Orchestrator rooted in a fresh temporary workdir with the test bank
/// installed
pub fn orchestrator() -> (tempfile::TempDir, Orchestrator) {
    let dir = tempfile::tempdir().expect("failed to create workdir");
    let mut config = Config::for_workdir(dir.path());
    config.module_dirs = vec![dir.path().join("modules")];
    config.storage_file = Some(dir.path().join("storage.json"));

    let orchestrator = Orchestrator::new(config).expect("failed to create orchestrator");
    orchestrator
        .registry()
        .install_module(Arc::new(TestBankModule));
    (dir, orchestrator)
}

/// Parameters for a test bank entry
pub fn bank_params(login: &str, password: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("login".to_string(), login.to_string()),
        ("password".to_string(), password.to_string()),
    ])
}
