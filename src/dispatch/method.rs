//! Operations addressed by method name

use std::fmt;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;

use super::{Operation, Outcome};
use crate::backend::Backend;
use crate::capabilities::{CapBank, CapMessages, Capability};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    IterAccounts,
    GetAccount,
    IterHistory,
    IterThreads,
    GetThread,
    IterUnreadMessages,
    PostMessage,
}

impl Method {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "iter_accounts" => Self::IterAccounts,
            "get_account" => Self::GetAccount,
            "iter_history" => Self::IterHistory,
            "iter_threads" => Self::IterThreads,
            "get_thread" => Self::GetThread,
            "iter_unread_messages" => Self::IterUnreadMessages,
            "post_message" => Self::PostMessage,
            _ => return None,
        })
    }

    const fn capability(self) -> Capability {
        match self {
            Self::IterAccounts | Self::GetAccount | Self::IterHistory => Capability::Bank,
            Self::IterThreads | Self::GetThread | Self::IterUnreadMessages | Self::PostMessage => {
                Capability::Messages
            }
        }
    }
}

/// A capability method called by name, yielding JSON items
///
/// Known names are the methods of [`CapBank`] and [`CapMessages`]; string
/// arguments are passed positionally. An unknown name fails on every target
/// with [`Error::UnknownMethod`].
#[derive(Clone)]
pub struct MethodCall {
    name: String,
    method: Option<Method>,
    args: Vec<String>,
}

impl MethodCall {
    /// Call `name` with positional `args`
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        Self {
            method: Method::parse(&name),
            name,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Method name as given
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn arg(&self, index: usize) -> anyhow::Result<&str> {
        self.args
            .get(index)
            .map(String::as_str)
            .with_context(|| format!("{} expects argument #{}", self.name, index + 1))
    }

    async fn call<'a>(&'a self, backend: &'a mut dyn Backend) -> anyhow::Result<Outcome<'a, Value>> {
        let Some(method) = self.method else {
            return Err(Error::UnknownMethod(self.name.clone()).into());
        };

        let outcome = match method {
            Method::IterAccounts => Outcome::Stream(to_values(bank(backend)?.iter_accounts())),
            Method::GetAccount => {
                let id = self.arg(0)?;
                value_of(bank(backend)?.get_account(id).await?)?
            }
            Method::IterHistory => {
                let id = self.arg(0)?;
                Outcome::Stream(to_values(bank(backend)?.iter_history(id)))
            }
            Method::IterThreads => Outcome::Stream(to_values(messages(backend)?.iter_threads())),
            Method::GetThread => {
                let id = self.arg(0)?;
                value_of(messages(backend)?.get_thread(id).await?)?
            }
            Method::IterUnreadMessages => {
                Outcome::Stream(to_values(messages(backend)?.iter_unread_messages()))
            }
            Method::PostMessage => {
                let (thread, content) = (self.arg(0)?, self.arg(1)?);
                messages(backend)?.post_message(thread, content).await?;
                Outcome::Nothing
            }
        };
        Ok(outcome)
    }
}

impl Operation<Value> for MethodCall {
    fn invoke<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
    ) -> BoxFuture<'a, anyhow::Result<Outcome<'a, Value>>> {
        self.call(backend).boxed()
    }

    fn capability(&self) -> Option<Capability> {
        self.method.map(Method::capability)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

impl fmt::Debug for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCall")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

fn bank(backend: &mut dyn Backend) -> anyhow::Result<&mut dyn CapBank> {
    backend
        .as_bank()
        .with_context(|| format!("backend does not implement {}", Capability::Bank))
}

fn messages(backend: &mut dyn Backend) -> anyhow::Result<&mut dyn CapMessages> {
    backend
        .as_messages()
        .with_context(|| format!("backend does not implement {}", Capability::Messages))
}

fn to_values<'a, T>(items: BoxStream<'a, anyhow::Result<T>>) -> BoxStream<'a, anyhow::Result<Value>>
where
    T: Serialize + 'a,
{
    items
        .map(|item| item.and_then(|item| Ok(serde_json::to_value(item)?)))
        .boxed()
}

/// `None` results are not forwarded
fn value_of<'a, T: Serialize>(item: Option<T>) -> anyhow::Result<Outcome<'a, Value>> {
    Ok(match item {
        Some(item) => Outcome::Value(serde_json::to_value(item)?),
        None => Outcome::Nothing,
    })
}
