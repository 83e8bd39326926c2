use crate::command::HandlerTable;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Builds handler tables out of a small catalogue of test commands.
pub struct HandlerTableFactory {
    names: Vec<&'static str>,
    slow_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl HandlerTableFactory {
    pub fn new() -> Self {
        Self {
            names: vec!["echo", "add", "fail"],
            slow_delay: Duration::from_millis(200),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Restricts the table to `names` out of: `echo`, `add`, `fail`, `slow`,
    /// `panic`, `count`.
    pub fn with_commands(mut self, names: &[&'static str]) -> Self {
        self.names = names.to_vec();
        self
    }

    pub fn with_slow_delay(mut self, delay: Duration) -> Self {
        self.slow_delay = delay;
        self
    }

    /// Counter incremented by every handler invocation.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn create(self) -> HandlerTable {
        let mut builder = HandlerTable::builder();
        for name in self.names {
            let calls = Arc::clone(&self.calls);
            builder = match name {
                "echo" => builder.command("echo", "Returns its first argument", move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, anyhow::Error>(args.into_iter().next().unwrap_or(Value::Null)) }
                }),
                "add" => builder.blocking("add", "Sums numeric arguments", move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut total = 0.0;
                    for arg in &args {
                        total += arg
                            .as_f64()
                            .ok_or_else(|| anyhow::anyhow!("not a number: {arg}"))?;
                    }
                    Ok(json!(total))
                }),
                "fail" => builder.command("fail", "Always fails", move |_args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<Value, _>(anyhow::anyhow!("device offline")) }
                }),
                "slow" => {
                    let delay = self.slow_delay;
                    builder.command("slow", "Sleeps, then returns 'done'", move |_args| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            tokio::time::sleep(delay).await;
                            Ok::<_, anyhow::Error>(json!("done"))
                        }
                    })
                }
                "panic" => builder.command("panic", "Panics", move |_args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { explode() }
                }),
                "count" => builder.command("count", "Returns the number of arguments", move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, anyhow::Error>(json!(args.len())) }
                }),
                other => panic!("unknown test command {other}"),
            };
        }
        builder.build()
    }
}

fn explode() -> anyhow::Result<Value> {
    panic!("handler exploded")
}
