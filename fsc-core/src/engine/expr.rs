//! Zone output expressions
//!
//! An expression combines controller outputs over sensor variables, e.g.
//!
//! ```json
//! {"max": [
//!     {"apply": {"profile": "cpu", "arg": {"var": "mb:cpu_temp"}}},
//!     {"apply": {"profile": "inlet", "arg": {"var": "mb:inlet_temp"}}}
//! ]}
//! ```
//!
//! Absence propagates: a variable that could not be read is `None`, an
//! `apply` over `None` does not run its controller, and `max`/`min` ignore
//! absent operands (all absent means absent). `sum` treats an absent operand
//! as the identity in the same way.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::engine::controller::{Controller, ProfileSpec, TickContext};
use crate::error::{FscError, Result};

/// Expression tree as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprNode {
    Max(Vec<ExprNode>),
    Min(Vec<ExprNode>),
    Sum(Vec<ExprNode>),
    Apply { profile: String, arg: Box<ExprNode> },
    /// `board:sensor` variable bound from the tick's sensor map
    Var(String),
    Const(f64),
}

/// Variable values for one evaluation
pub type Bindings = HashMap<String, Option<f64>>;

/// Evaluation interface used by zones
pub trait Expression: fmt::Debug + Send {
    /// External `board:sensor` variables referenced by the expression
    fn ext_vars(&self) -> &[String];

    fn eval(&mut self, bindings: &Bindings, ctx: &TickContext) -> Option<f64>;

    /// Evaluate and also return a textual trace of every intermediate value
    fn debug_eval(&mut self, bindings: &Bindings, ctx: &TickContext) -> (Option<f64>, String);
}

#[derive(Debug)]
enum Node {
    Max(Vec<Node>),
    Min(Vec<Node>),
    Sum(Vec<Node>),
    Apply {
        profile: String,
        controller: Box<Controller>,
        arg: Box<Node>,
    },
    Var(String),
    Const(f64),
}

/// An expression with its own controller instances
#[derive(Debug)]
pub struct CompiledExpr {
    root: Node,
    ext_vars: Vec<String>,
}

/// Build an expression, instantiating one controller per `apply`
pub fn compile(node: &ExprNode, profiles: &BTreeMap<String, ProfileSpec>) -> Result<CompiledExpr> {
    let mut ext_vars = Vec::new();
    let root = compile_node(node, profiles, &mut ext_vars)?;
    Ok(CompiledExpr { root, ext_vars })
}

fn compile_node(node: &ExprNode, profiles: &BTreeMap<String, ProfileSpec>, vars: &mut Vec<String>) -> Result<Node> {
    let compile_all = |children: &[ExprNode], op: &str, vars: &mut Vec<String>| -> Result<Vec<Node>> {
        if children.is_empty() {
            return Err(FscError::invalid_config("expr", format!("`{}` needs at least one operand", op)));
        }
        children.iter().map(|c| compile_node(c, profiles, vars)).collect()
    };

    Ok(match node {
        ExprNode::Max(children) => Node::Max(compile_all(children, "max", vars)?),
        ExprNode::Min(children) => Node::Min(compile_all(children, "min", vars)?),
        ExprNode::Sum(children) => Node::Sum(compile_all(children, "sum", vars)?),
        ExprNode::Apply { profile, arg } => {
            let spec = profiles.get(profile).ok_or_else(|| FscError::UnknownReference {
                kind: "profile",
                name: profile.clone(),
            })?;
            let controller = Controller::from_profile(profile, spec)?;
            Node::Apply {
                profile: profile.clone(),
                controller: Box::new(controller),
                arg: Box::new(compile_node(arg, profiles, vars)?),
            }
        }
        ExprNode::Var(name) => {
            if !is_qualified(name) {
                return Err(FscError::invalid_config(
                    "expr",
                    format!("variable `{}` must be written as board:sensor", name),
                ));
            }
            if !vars.contains(name) {
                vars.push(name.clone());
            }
            Node::Var(name.clone())
        }
        ExprNode::Const(value) => {
            if !value.is_finite() {
                return Err(FscError::invalid_config("expr", "constants must be finite"));
            }
            Node::Const(*value)
        }
    })
}

fn is_qualified(name: &str) -> bool {
    match name.split_once(':') {
        Some((board, sensor)) => !board.is_empty() && !sensor.is_empty(),
        None => false,
    }
}

fn fmt_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "None".to_string(),
    }
}

impl Node {
    fn eval(&mut self, bindings: &Bindings, ctx: &TickContext, trace: Option<&mut String>) -> Option<f64> {
        match self {
            Node::Max(children) => eval_nary(NaryOp::Max, children, bindings, ctx, trace),
            Node::Min(children) => eval_nary(NaryOp::Min, children, bindings, ctx, trace),
            Node::Sum(children) => eval_nary(NaryOp::Sum, children, bindings, ctx, trace),
            Node::Apply { profile, controller, arg } => {
                let mut inner = String::new();
                let input = arg.eval(bindings, ctx, trace.is_some().then_some(&mut inner));
                let output = input.and_then(|v| controller.run(v, ctx));
                if let Some(t) = trace {
                    t.push_str(&format!("{}({}) = {}", profile, inner, fmt_value(output)));
                }
                output
            }
            Node::Var(name) => {
                let value = bindings.get(name.as_str()).copied().flatten().filter(|v| v.is_finite());
                if let Some(t) = trace {
                    t.push_str(&format!("{}={}", name, fmt_value(value)));
                }
                value
            }
            Node::Const(value) => {
                if let Some(t) = trace {
                    t.push_str(&format!("{}", value));
                }
                Some(*value)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NaryOp {
    Max,
    Min,
    Sum,
}

impl NaryOp {
    fn name(self) -> &'static str {
        match self {
            NaryOp::Max => "max",
            NaryOp::Min => "min",
            NaryOp::Sum => "sum",
        }
    }
}

fn eval_nary(
    op: NaryOp,
    children: &mut [Node],
    bindings: &Bindings,
    ctx: &TickContext,
    trace: Option<&mut String>,
) -> Option<f64> {
    let mut parts = Vec::with_capacity(children.len());
    let mut values = Vec::with_capacity(children.len());
    for child in children.iter_mut() {
        let mut part = String::new();
        values.push(child.eval(bindings, ctx, trace.is_some().then_some(&mut part)));
        parts.push(part);
    }

    let present = values.iter().flatten().copied();
    let result = match op {
        NaryOp::Max => present.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
        NaryOp::Min => present.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v)))),
        NaryOp::Sum => present.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a + v))),
    };

    if let Some(t) = trace {
        t.push_str(&format!("{}({}) = {}", op.name(), parts.join(", "), fmt_value(result)));
    }
    result
}

impl Expression for CompiledExpr {
    fn ext_vars(&self) -> &[String] {
        &self.ext_vars
    }

    fn eval(&mut self, bindings: &Bindings, ctx: &TickContext) -> Option<f64> {
        self.root.eval(bindings, ctx, None)
    }

    fn debug_eval(&mut self, bindings: &Bindings, ctx: &TickContext) -> (Option<f64>, String) {
        let mut trace = String::new();
        let value = self.root.eval(bindings, ctx, Some(&mut trace));
        (value, trace)
    }
}
