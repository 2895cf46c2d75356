//! In-crate mock modules for unit tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::backend::{Backend, BackendInstance, ParamSpec, Params};
use crate::capabilities::{Account, CapBank, CapMessages, Capability, Message, Thread, Transaction};
use crate::modules::{BackendModule, Module};
use crate::storage::BackendStorage;

/// Bank whose accounts are derived from its parameters
///
/// `accounts` sets how many accounts are listed, `delay_ms` delays each one,
/// and `fail_after` makes listing fail once that many accounts were yielded.
pub struct MockBankModule;

const BANK_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("login", "Account login"),
    ParamSpec::optional("accounts", "Number of accounts").with_default("3"),
    ParamSpec::optional("delay_ms", "Delay before each account").with_default("0"),
    ParamSpec::optional("fail_after", "Fail after this many accounts"),
];

impl BackendModule for MockBankModule {
    fn name(&self) -> &str {
        "mockbank"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Bank]
    }

    fn params(&self) -> &[ParamSpec] {
        BANK_PARAMS
    }

    fn create_instance(
        &self,
        params: Params,
        _storage: BackendStorage,
    ) -> anyhow::Result<Box<dyn Backend>> {
        let number = |key: &str| -> anyhow::Result<Option<u64>> {
            params.get(key).map(str::parse::<u64>).transpose().map_err(Into::into)
        };
        Ok(Box::new(MockBank {
            login: params.get("login").unwrap_or_default().to_string(),
            accounts: number("accounts")?.unwrap_or(3),
            delay: Duration::from_millis(number("delay_ms")?.unwrap_or(0)),
            fail_after: number("fail_after")?,
        }))
    }
}

struct MockBank {
    login: String,
    accounts: u64,
    delay: Duration,
    fail_after: Option<u64>,
}

impl MockBank {
    fn account(&self, index: u64) -> Account {
        Account {
            id: format!("{}-{index}", self.login),
            label: format!("Account {index}"),
            balance: 100,
            currency: "EUR".to_string(),
        }
    }
}

impl Backend for MockBank {
    fn as_bank(&mut self) -> Option<&mut dyn CapBank> {
        Some(self)
    }
}

#[async_trait]
impl CapBank for MockBank {
    fn iter_accounts(&mut self) -> BoxStream<'_, anyhow::Result<Account>> {
        let this = &*self;
        futures::stream::iter(0..this.accounts)
            .then(move |index| async move {
                if !this.delay.is_zero() {
                    tokio::time::sleep(this.delay).await;
                }
                if this.fail_after == Some(index) {
                    anyhow::bail!("invalid credentials for {}", this.login);
                }
                Ok(this.account(index))
            })
            .boxed()
    }

    async fn get_account(&mut self, id: &str) -> anyhow::Result<Option<Account>> {
        Ok((0..self.accounts)
            .map(|index| self.account(index))
            .find(|account| account.id == id))
    }

    fn iter_history<'a>(
        &'a mut self,
        account_id: &'a str,
    ) -> BoxStream<'a, anyhow::Result<Transaction>> {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let items = (0..2).map(move |index| {
            Ok(Transaction {
                id: format!("{account_id}-t{index}"),
                date,
                label: "Transfer".to_string(),
                amount: -10,
            })
        });
        futures::stream::iter(items).boxed()
    }
}

/// Messaging backend with one thread of two messages
pub struct MockMessagesModule;

impl BackendModule for MockMessagesModule {
    fn name(&self) -> &str {
        "mockmessages"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Messages]
    }

    fn create_instance(
        &self,
        _params: Params,
        _storage: BackendStorage,
    ) -> anyhow::Result<Box<dyn Backend>> {
        let messages = (0..2)
            .map(|index| Message {
                id: index.to_string(),
                thread_id: "t1".to_string(),
                sender: "alice".to_string(),
                content: format!("hello {index}"),
                date: Utc.timestamp_opt(1_700_000_000 + index, 0).unwrap(),
            })
            .collect();
        Ok(Box::new(MockMessages {
            thread: Thread {
                id: "t1".to_string(),
                title: "Greetings".to_string(),
                messages,
            },
        }))
    }
}

struct MockMessages {
    thread: Thread,
}

impl Backend for MockMessages {
    fn as_messages(&mut self) -> Option<&mut dyn CapMessages> {
        Some(self)
    }
}

#[async_trait]
impl CapMessages for MockMessages {
    fn iter_threads(&mut self) -> BoxStream<'_, anyhow::Result<Thread>> {
        let thread = Thread {
            messages: Vec::new(),
            ..self.thread.clone()
        };
        futures::stream::iter([Ok(thread)]).boxed()
    }

    async fn get_thread(&mut self, id: &str) -> anyhow::Result<Option<Thread>> {
        Ok((self.thread.id == id).then(|| self.thread.clone()))
    }

    fn iter_unread_messages(&mut self) -> BoxStream<'_, anyhow::Result<Message>> {
        futures::stream::iter(self.thread.messages.clone().into_iter().map(Ok)).boxed()
    }

    async fn post_message(&mut self, thread_id: &str, content: &str) -> anyhow::Result<()> {
        anyhow::ensure!(thread_id == self.thread.id, "no thread {thread_id}");
        let id = self.thread.messages.len().to_string();
        self.thread.messages.push(Message {
            id,
            thread_id: thread_id.to_string(),
            sender: "me".to_string(),
            content: content.to_string(),
            date: Utc::now(),
        });
        Ok(())
    }
}

/// Live instance of `module` named `name`
pub async fn instance(
    module: Arc<dyn BackendModule>,
    name: &str,
    params: &[(&str, &str)],
) -> Arc<BackendInstance> {
    let raw: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    let module = Arc::new(Module::new(module, None));
    let storage = BackendStorage::new(name, None);
    Arc::new(
        BackendInstance::create(name, module, &raw, storage)
            .await
            .expect("mock instance"),
    )
}

/// Live mock bank instance
pub async fn bank(name: &str, params: &[(&str, &str)]) -> Arc<BackendInstance> {
    instance(Arc::new(MockBankModule), name, params).await
}

/// Live mock messaging instance
pub async fn messages(name: &str) -> Arc<BackendInstance> {
    instance(Arc::new(MockMessagesModule), name, &[]).await
}
