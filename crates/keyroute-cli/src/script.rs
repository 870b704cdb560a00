//! Simulation scripts
//!
//! A script is JSON Lines, one step per line, tagged by `op`. Blank lines
//! and lines starting with `#` are skipped.
//!
//! ```text
//! {"op": "select", "route": "default", "session": "s1"}
//! {"op": "error", "key": "gemini/k1/pro", "status": 429, "code": "MODEL_CAPACITY_EXHAUSTED"}
//! {"op": "advance", "secs": 60}
//! ```

use anyhow::Context;
use keyroute_core::{
    Clock, ExternalQuotaSnapshot, ManualClock, ProviderErrorEvent, ProviderKey,
    ProviderSuccessEvent, RequestHint, RoutingInstruction, SelectionContext,
};
use keyroute_routing::RoutingEngine;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Select {
        #[serde(default = "default_route")]
        route: String,
        #[serde(default)]
        session: Option<String>,
        #[serde(default)]
        instructions: Vec<RoutingInstruction>,
        /// Keys that already failed; a non-empty list marks a retry
        #[serde(default)]
        exclude: Vec<String>,
        #[serde(default)]
        hint: Option<RequestHint>,
    },
    Error {
        key: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        retry_after_ms: Option<i64>,
        #[serde(default)]
        session: Option<String>,
    },
    Success {
        key: String,
    },
    Usage {
        key: String,
        #[serde(default)]
        tokens: u64,
    },
    Quota {
        key: String,
        remaining_fraction: f64,
        #[serde(default)]
        reset_at_ms: Option<i64>,
    },
    Advance {
        #[serde(default)]
        secs: i64,
        #[serde(default)]
        ms: i64,
    },
    Reset {
        key: String,
    },
}

fn default_route() -> String {
    "default".to_string()
}

/// Parse a JSONL script
pub fn parse_script(content: &str) -> anyhow::Result<Vec<Step>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid step on line {}", index + 1))
        })
        .collect()
}

fn parse_key(key: &str) -> anyhow::Result<ProviderKey> {
    Ok(key.parse::<ProviderKey>()?)
}

/// Apply one step and describe what happened
pub fn run_step(engine: &RoutingEngine, clock: &ManualClock, step: &Step) -> anyhow::Result<Value> {
    let now = clock.now_ms();

    let output = match step {
        Step::Select {
            route,
            session,
            instructions,
            exclude,
            hint,
        } => {
            let mut ctx = SelectionContext::new();
            ctx.instructions = instructions.clone();
            ctx.session_key = session.clone();
            ctx.hint = *hint;
            for key in exclude {
                ctx = ctx.retry_excluding(parse_key(key)?);
            }

            let selection = engine.select(route, &ctx)?;
            json!({ "op": "select", "at": now, "route": route, "result": selection })
        }
        Step::Error {
            key,
            status,
            code,
            retry_after_ms,
            session,
        } => {
            let mut event = ProviderErrorEvent::new(parse_key(key)?, now);
            event.http_status = *status;
            event.error_code = code.clone();
            event.retry_after_ms = *retry_after_ms;

            let outcome = engine.record_error(&event, session.as_deref());
            json!({ "op": "error", "at": now, "key": key, "outcome": outcome })
        }
        Step::Success { key } => {
            let reason = engine.record_success(&ProviderSuccessEvent::new(parse_key(key)?, now));
            json!({ "op": "success", "at": now, "key": key, "reason": reason })
        }
        Step::Usage { key, tokens } => {
            let reason = engine.record_usage(&parse_key(key)?, *tokens);
            json!({ "op": "usage", "at": now, "key": key, "reason": reason })
        }
        Step::Quota {
            key,
            remaining_fraction,
            reset_at_ms,
        } => {
            let reason = engine.merge_external_quota(&ExternalQuotaSnapshot {
                provider_key: parse_key(key)?,
                remaining_fraction: *remaining_fraction,
                reset_at_ms: *reset_at_ms,
            });
            json!({ "op": "quota", "at": now, "key": key, "reason": reason })
        }
        Step::Advance { secs, ms } => {
            clock.advance(secs * 1000 + ms);
            json!({ "op": "advance", "at": clock.now_ms() })
        }
        Step::Reset { key } => {
            let reset = engine.reset_key(&parse_key(key)?);
            json!({ "op": "reset", "at": now, "key": key, "reset": reset })
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyroute_routing::RoutingConfig;
    use std::sync::Arc;

    const CONFIG: &str = r#"
routes:
  default:
    tiers:
      - mode: priority
        targets:
          - { provider: gemini, model: pro, aliases: [k1, k2] }
"#;

    fn engine() -> (RoutingEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let engine =
            RoutingEngine::with_clock(RoutingConfig::from_yaml(CONFIG).unwrap(), clock.clone()).unwrap();
        (engine, clock)
    }

    #[test]
    fn test_parse_script_skips_comments() {
        let steps = parse_script(
            r#"
# warm up
{"op": "select"}

{"op": "advance", "secs": 5}
{"op": "error", "key": "gemini/k1/pro", "status": 500}
"#,
        )
        .unwrap();

        assert_eq!(steps.len(), 3);
        assert!(matches!(&steps[0], Step::Select { route, .. } if route == "default"));
        assert_eq!(steps[1], Step::Advance { secs: 5, ms: 0 });
    }

    #[test]
    fn test_parse_script_reports_line() {
        let err = parse_script("{\"op\": \"select\"}\n{\"op\": \"jump\"}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_run_steps() {
        let (engine, clock) = engine();
        let script = parse_script(
            r#"
{"op": "error", "key": "gemini/k1/pro", "status": 401}
{"op": "select"}
{"op": "advance", "ms": 1500}
{"op": "reset", "key": "gemini/k1/pro"}
{"op": "select", "exclude": ["gemini/k2/pro"]}
"#,
        )
        .unwrap();

        let outputs: Vec<Value> = script
            .iter()
            .map(|step| run_step(&engine, &clock, step).unwrap())
            .collect();

        assert_eq!(outputs[0]["outcome"]["reason"], "fatal");
        assert_eq!(outputs[1]["result"]["providerKey"]["key_alias"], "k2");
        assert_eq!(outputs[2]["at"], 1500);
        assert_eq!(outputs[3]["reset"], true);
        assert_eq!(outputs[4]["result"]["providerKey"]["key_alias"], "k1");
    }

    #[test]
    fn test_invalid_key_is_error() {
        let (engine, clock) = engine();
        let step = Step::Success {
            key: "not-a-key".to_string(),
        };
        assert!(run_step(&engine, &clock, &step).is_err());
    }
}
