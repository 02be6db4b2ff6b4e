//! `$/progress` dispatch: work-done progress notifications and partial-result collectors.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque identifier tying `$/progress` notifications to the operation that requested them.
///
/// No generation strategy is prescribed by the protocol; uniqueness within a session is the
/// caller's responsibility, matching the spec's resolution of the `createProgressToken` open
/// question (string and numeric forms both occur in the wild; this type accepts either).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// Numeric token.
    Number(i64),
    /// String token.
    String(String),
}

impl Display for ProgressToken {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ProgressToken::Number(n) => write!(f, "{n}"),
            ProgressToken::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        ProgressToken::Number(n)
    }
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        ProgressToken::String(s)
    }
}

/// The payload of a `$/progress` notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressParams {
    /// The token identifying the operation this progress update belongs to.
    pub token: ProgressToken,
    /// The progress value; either a [`WorkDoneProgress`] object or an arbitrary partial result.
    pub value: Value,
}

/// The three stages of an LSP "work done progress" report.
///
/// Constructors omit optional fields that are unset, while preserving explicitly-set falsy values
/// (an empty `message` or a `percentage` of `0` are kept, not treated as absent).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkDoneProgress {
    /// The first notification for an operation, announcing it has begun.
    #[serde(rename_all = "camelCase")]
    Begin {
        /// Human-readable title of the operation.
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Whether the operation supports being cancelled via `window/workDoneProgress/cancel`.
        cancellable: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Short progress message.
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Progress percentage, `0`-`100`.
        percentage: Option<u32>,
    },
    /// A progress update for an already-announced operation.
    #[serde(rename_all = "camelCase")]
    Report {
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Whether the operation supports being cancelled.
        cancellable: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Short progress message.
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Progress percentage, `0`-`100`.
        percentage: Option<u32>,
    },
    /// The final notification for an operation.
    End {
        #[serde(skip_serializing_if = "Option::is_none")]
        /// Short final message.
        message: Option<String>,
    },
}

impl WorkDoneProgress {
    /// Builds a `begin` report, omitting unset optional fields.
    pub fn begin(title: impl Into<String>) -> Self {
        WorkDoneProgress::Begin {
            title: title.into(),
            cancellable: None,
            message: None,
            percentage: None,
        }
    }

    /// Builds a `report` update, omitting unset optional fields.
    pub fn report() -> Self {
        WorkDoneProgress::Report {
            cancellable: None,
            message: None,
            percentage: None,
        }
    }

    /// Builds an `end` report, omitting the unset optional message.
    pub fn end() -> Self {
        WorkDoneProgress::End { message: None }
    }
}

/// The terminal outcome of a request that streamed partial results.
#[derive(Clone, Debug, PartialEq)]
pub enum PartialResultOutcome<T> {
    /// The request completed normally; `partials` holds every value delivered before `result`.
    Completed { partials: Vec<Value>, result: T },
    /// The request was cancelled; `partials` holds every value delivered before cancellation.
    Cancelled { partials: Vec<Value> },
    /// The request failed with a non-cancellation error; `partials` holds every value already
    /// delivered before the error arrived.
    Errored { partials: Vec<Value>, error: crate::jsonrpc::Error },
}

struct Collector {
    partials: std::sync::Mutex<Vec<Value>>,
    on_partial: Box<dyn Fn(&Value) + Send + Sync>,
}

/// Per-session table mapping outstanding [`ProgressToken`]s to their partial-result collectors.
///
/// No direct teacher precedent (`tower-lsp` implements no `$/progress` handling); grounded in the
/// same `DashMap<Key, _>` idiom the pending-request tracker and handler registry already use, for
/// consistency of style. Subscription is the sole delivery mechanism: a token with no collector
/// registered is a silent no-op, resolving the spec's `partialResultToken`-in-params open question.
#[derive(Default)]
pub struct ProgressTable {
    collectors: DashMap<ProgressToken, Arc<Collector>>,
}

impl ProgressTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        ProgressTable::default()
    }

    /// Subscribes a collector for `token`. `on_partial` is invoked, in arrival order, for every
    /// `$/progress` value received for this token before termination.
    pub fn subscribe<F>(&self, token: ProgressToken, on_partial: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.collectors.insert(
            token,
            Arc::new(Collector {
                partials: std::sync::Mutex::new(Vec::new()),
                on_partial: Box::new(on_partial),
            }),
        );
    }

    /// Delivers one `$/progress` value to the subscriber for `token`, if any.
    ///
    /// Values that arrive for a token with no active subscription, or after that subscription was
    /// terminated, are dropped silently.
    pub fn deliver(&self, token: &ProgressToken, value: Value) {
        if let Some(collector) = self.collectors.get(token) {
            (collector.on_partial)(&value);
            collector.partials.lock().unwrap().push(value);
        }
    }

    /// Terminates the collector for `token` with a completed result, returning the full outcome.
    pub fn complete<T>(&self, token: &ProgressToken, result: T) -> PartialResultOutcome<T> {
        let partials = self.take_partials(token);
        PartialResultOutcome::Completed { partials, result }
    }

    /// Terminates the collector for `token` due to cancellation.
    pub fn cancel(&self, token: &ProgressToken) -> PartialResultOutcome<()> {
        let partials = self.take_partials(token);
        PartialResultOutcome::Cancelled { partials }
    }

    /// Terminates the collector for `token` due to a non-cancellation error.
    pub fn error(&self, token: &ProgressToken, error: crate::jsonrpc::Error) -> PartialResultOutcome<()> {
        let partials = self.take_partials(token);
        PartialResultOutcome::Errored { partials, error }
    }

    fn take_partials(&self, token: &ProgressToken) -> Vec<Value> {
        self.collectors
            .remove(token)
            .map(|(_, collector)| collector.partials.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn delivers_partials_in_arrival_order() {
        let table = ProgressTable::new();
        let token = ProgressToken::String("p1".into());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        table.subscribe(token.clone(), move |v| seen2.lock().unwrap().push(v.clone()));

        table.deliver(&token, json!("first"));
        table.deliver(&token, json!("second"));

        assert_eq!(*seen.lock().unwrap(), vec![json!("first"), json!("second")]);

        let outcome = table.complete(&token, json!(["final"]));
        match outcome {
            PartialResultOutcome::Completed { partials, result } => {
                assert_eq!(partials, vec![json!("first"), json!("second")]);
                assert_eq!(result, json!(["final"]));
            }
            _ => panic!("expected Completed"),
        }
    }

    #[test]
    fn unsubscribed_token_drops_silently() {
        let table = ProgressTable::new();
        let token = ProgressToken::Number(1);
        // No panic, no effect.
        table.deliver(&token, json!("orphaned"));
    }

    #[test]
    fn partials_after_completion_are_dropped() {
        let table = ProgressTable::new();
        let token = ProgressToken::Number(1);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        table.subscribe(token.clone(), move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        table.deliver(&token, json!(1));
        table.complete(&token, json!("done"));
        // Late partial: no collector remains, so it's silently dropped rather than re-subscribed.
        table.deliver(&token, json!(2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_preserves_partials_seen_so_far() {
        let table = ProgressTable::new();
        let token = ProgressToken::Number(1);
        table.subscribe(token.clone(), |_| {});
        table.deliver(&token, json!("a"));

        match table.cancel(&token) {
            PartialResultOutcome::Cancelled { partials } => assert_eq!(partials, vec![json!("a")]),
            _ => panic!("expected Cancelled"),
        }
    }

    #[test]
    fn begin_report_omits_unset_fields() {
        let begin = WorkDoneProgress::begin("Indexing");
        let value = serde_json::to_value(&begin).unwrap();
        assert_eq!(value["kind"], json!("begin"));
        assert_eq!(value["title"], json!("Indexing"));
        assert!(value.get("percentage").is_none());
    }

    #[test]
    fn explicit_zero_percentage_is_preserved() {
        let begin = WorkDoneProgress::Begin {
            title: "x".into(),
            cancellable: None,
            message: Some(String::new()),
            percentage: Some(0),
        };
        let value = serde_json::to_value(&begin).unwrap();
        assert_eq!(value["percentage"], json!(0));
        assert_eq!(value["message"], json!(""));
    }
}
