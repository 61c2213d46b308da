//! # Navigation scripts
//!
//! One command per line, `#` starts a comment:
//!
//! ```text
//! switch Shop
//! open Shop Home
//! open Shop.Home Cart
//! next Shop.Home
//! set cart.items [1,2] Shop.Home
//! tree
//! ```
//!
//! Every command becomes a [`Command`] and [`run`] applies it to a
//! [`Flow`], returning one line of output.

use std::fmt;

use serde_json::Value;

use crate::flow::{Flow, StateScope};
use crate::store::SetOptions;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Switch(String),
    Open { parent: String, child: String },
    Close(String),
    Next(String),
    Prev(String),
    GoTo { parent: String, path: Vec<String> },
    Tab { parent: String, name: String },
    Drawer { parent: String, name: Option<String> },
    Set { key: String, value: Value, parent: Option<String> },
    Get { key: String, parent: Option<String> },
    Tree,
    Validate,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Bare words that are not JSON are taken as strings.
fn value_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parses one line. `Ok(None)` for blanks and comments.
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.split('#').next().unwrap_or("").trim();
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, args)) = words.split_first() else {
        return Ok(None);
    };
    let owned = |i: usize| args.get(i).map(|s| s.to_string());
    let need = |n: usize| {
        if args.len() < n {
            Err(format!("'{verb}' needs {n} argument(s)"))
        } else {
            Ok(())
        }
    };

    let command = match verb {
        "switch" => {
            need(1)?;
            Command::Switch(args[0].to_string())
        }
        "open" => {
            need(2)?;
            Command::Open {
                parent: args[0].to_string(),
                child: args[1].to_string(),
            }
        }
        "close" => {
            need(1)?;
            Command::Close(args[0].to_string())
        }
        "next" => {
            need(1)?;
            Command::Next(args[0].to_string())
        }
        "prev" => {
            need(1)?;
            Command::Prev(args[0].to_string())
        }
        "goto" => {
            need(2)?;
            Command::GoTo {
                parent: args[0].to_string(),
                path: args[1..].iter().map(|s| s.to_string()).collect(),
            }
        }
        "tab" => {
            need(2)?;
            Command::Tab {
                parent: args[0].to_string(),
                name: args[1].to_string(),
            }
        }
        "drawer" => {
            need(1)?;
            Command::Drawer {
                parent: args[0].to_string(),
                name: owned(1),
            }
        }
        "set" => {
            need(2)?;
            Command::Set {
                key: args[0].to_string(),
                value: value_arg(args[1]),
                parent: owned(2),
            }
        }
        "get" => {
            need(1)?;
            Command::Get {
                key: args[0].to_string(),
                parent: owned(1),
            }
        }
        "tree" => Command::Tree,
        "validate" => Command::Validate,
        "snapshot" => Command::Snapshot,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

pub fn parse(source: &str) -> Result<Vec<Command>, ParseError> {
    let mut commands = Vec::new();
    for (i, line) in source.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(cmd)) => commands.push(cmd),
            Ok(None) => {}
            Err(message) => return Err(ParseError { line: i + 1, message }),
        }
    }
    Ok(commands)
}

fn scope(parent: &Option<String>) -> StateScope {
    match parent {
        Some(p) => StateScope::parent(p.clone()),
        None => StateScope::inferred(),
    }
}

fn verdict(label: String, ok: bool) -> String {
    format!("{label} -> {}", if ok { "ok" } else { "refused" })
}

pub async fn run(flow: &Flow, command: &Command) -> String {
    match command {
        Command::Switch(root) => verdict(format!("switch {root}"), flow.switch_root(root)),
        Command::Open { parent, child } => {
            verdict(format!("open {parent} {child}"), flow.open(parent, child).await)
        }
        Command::Close(parent) => verdict(format!("close {parent}"), flow.close(parent).await),
        Command::Next(parent) => verdict(format!("next {parent}"), flow.next(parent).await),
        Command::Prev(parent) => verdict(format!("prev {parent}"), flow.prev(parent).await),
        Command::GoTo { parent, path } => {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            verdict(
                format!("goto {parent} {}", path.join(" ")),
                flow.go_to(parent, &segments).await,
            )
        }
        Command::Tab { parent, name } => {
            verdict(format!("tab {parent} {name}"), flow.open_tab(parent, name).await)
        }
        Command::Drawer { parent, name } => verdict(
            format!("drawer {parent}"),
            flow.open_drawer(parent, name.as_deref()).await,
        ),
        Command::Set { key, value, parent } => {
            let result = flow
                .set(key, value.clone(), &scope(parent), SetOptions::new().persist())
                .await;
            match result {
                Ok(()) => format!("set {key} -> ok"),
                Err(e) => format!("set {key} -> {e}"),
            }
        }
        Command::Get { key, parent } => {
            let read = flow.get(key, &scope(parent)).await;
            if read.is_denied() {
                format!("get {key} -> denied")
            } else {
                match read.value() {
                    Some(v) => format!("get {key} -> {v}"),
                    None => format!("get {key} -> missing"),
                }
            }
        }
        Command::Tree => flow.print_tree(),
        Command::Validate => {
            let issues = flow.validate_hierarchy();
            if issues.is_empty() {
                "hierarchy ok".to_string()
            } else {
                issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("\n")
            }
        }
        Command::Snapshot => flow.state_registry_snapshot().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use serde_json::json;

    #[test]
    fn test_parse_commands() {
        let script = "\
# warm up
switch Shop
open Shop.Home Cart   # trailing comment
set cart.items [1,2] Shop.Home
set note hello
drawer Shop.Menu
";
        let commands = parse(script).unwrap();
        assert_eq!(commands.len(), 5);
        assert_eq!(
            commands[1],
            Command::Open {
                parent: "Shop.Home".into(),
                child: "Cart".into()
            }
        );
        assert_eq!(
            commands[2],
            Command::Set {
                key: "cart.items".into(),
                value: json!([1, 2]),
                parent: Some("Shop.Home".into())
            }
        );
        assert!(matches!(&commands[3], Command::Set { value, .. } if value == &json!("hello")));
        assert_eq!(
            commands[4],
            Command::Drawer {
                parent: "Shop.Menu".into(),
                name: None
            }
        );
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse("switch Shop\nopen Shop\n").unwrap_err();
        assert_eq!(err.line, 2);
        let err = parse("fly away").unwrap_err();
        assert!(err.message.contains("unknown command"));
    }

    #[tokio::test]
    async fn test_run_against_flow() {
        let flow = Flow::in_memory();
        Blueprint::parse(
            r#"
[[pack]]
name = "Shop"
[[pack.nodes]]
kind = "parent"
name = "Home"
[[pack.nodes.nodes]]
name = "Feed"
[[pack.nodes.nodes]]
name = "Cart"
"#,
        )
        .unwrap()
        .apply(flow.registry())
        .unwrap();

        let script = parse("switch Shop\nopen Shop Home\nopen Shop.Home Cart\nnext Shop.Home\nset n 3 Shop.Home\nget n Shop.Home\nopen Shop.Home Nope\n").unwrap();
        let mut out = Vec::new();
        for cmd in &script {
            out.push(run(&flow, cmd).await);
        }
        assert_eq!(out[3], "next Shop.Home -> ok");
        assert_eq!(out[5], "get n -> 3");
        assert_eq!(out[6], "open Shop.Home Nope -> refused");
        assert_eq!(
            flow.get_active("Shop.Home").map(|n| n.name),
            Some("Feed".to_string())
        );
    }
}
