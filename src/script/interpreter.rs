use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runtime::{FlowFailure, Outcome, ThreadTask};

use super::ast::{BinaryOp, UnaryOp};
use super::compiler::{CompiledScript, Instr};
use super::{Closure, Continuable, StepCall, Yielded};

/// 暂停原语的名字
pub const PAUSE: &str = "pause";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
enum Slot {
    Value(Value),
    Closure(Closure),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Handler {
    pc: usize,
    binding: String,
    stack_depth: usize,
    scope_depth: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RunState {
    Fresh,
    Waiting,
    Done,
}

enum Flow {
    Continue,
    Yield(ThreadTask),
    Return(Value),
}

/// 可序列化的栈式解释器，一个实例执行一个代码块
#[derive(Clone, Serialize, Deserialize)]
pub struct Interpreter {
    script: String,
    block: usize,
    pc: usize,
    stack: Vec<Slot>,
    scopes: Vec<BTreeMap<String, Value>>,
    handlers: Vec<Handler>,
    last: Value,
    state: RunState,
    #[serde(skip)]
    code: Option<Arc<CompiledScript>>,
}

impl Interpreter {
    pub fn new(code: Arc<CompiledScript>, block: usize, env: BTreeMap<String, Value>) -> Self {
        Self {
            script: code.name.clone(),
            block,
            pc: 0,
            stack: Vec::new(),
            scopes: vec![env],
            handlers: Vec::new(),
            last: Value::Null,
            state: RunState::Fresh,
            code: Some(code),
        }
    }

    pub fn for_closure(code: Arc<CompiledScript>, closure: &Closure) -> Self {
        Self::new(code, closure.block, closure.env.clone())
    }

    pub fn script_name(&self) -> &str {
        &self.script
    }

    pub fn is_attached(&self) -> bool {
        self.code.is_some()
    }

    /// 反序列化后重新挂上编译结果
    pub fn attach(&mut self, code: Arc<CompiledScript>) {
        self.code = Some(code);
    }

    fn finish(&mut self, outcome: Outcome) -> Yielded {
        self.state = RunState::Done;
        self.stack.clear();
        self.handlers.clear();
        Yielded::Done(outcome)
    }

    fn raise(&mut self, failure: FlowFailure) -> Option<Yielded> {
        match self.handlers.pop() {
            Some(handler) => {
                self.stack.truncate(handler.stack_depth);
                self.scopes.truncate(handler.scope_depth);
                let mut scope = BTreeMap::new();
                scope.insert(handler.binding, failure.to_value());
                self.scopes.push(scope);
                self.pc = handler.pc;
                None
            }
            None => Some(self.finish(Outcome::Abnormal(failure))),
        }
    }

    fn execute(&mut self, code: &CompiledScript) -> Yielded {
        let Some(block) = code.block(self.block) else {
            let message = format!("script `{}` has no block {}", self.script, self.block);
            return self.finish(Outcome::Abnormal(FlowFailure::error(message)));
        };
        loop {
            let Some(instr) = block.get(self.pc) else {
                let last = std::mem::take(&mut self.last);
                return self.finish(Outcome::Normal(last));
            };
            self.pc += 1;
            match self.step(instr) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield(task)) => {
                    self.state = RunState::Waiting;
                    return Yielded::Task(task);
                }
                Ok(Flow::Return(value)) => return self.finish(Outcome::Normal(value)),
                Err(failure) => {
                    if let Some(done) = self.raise(failure) {
                        return done;
                    }
                }
            }
        }
    }

    fn pop(&mut self) -> Result<Value, FlowFailure> {
        match self.stack.pop() {
            Some(Slot::Value(value)) => Ok(value),
            Some(Slot::Closure(_)) => Err(FlowFailure::error("a block can only be passed to a step")),
            None => Err(FlowFailure::error("interpreter stack underflow")),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, FlowFailure> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
            .ok_or_else(|| FlowFailure::error(format!("No such variable: {name}")))
    }

    fn captured(&self) -> BTreeMap<String, Value> {
        let mut env = BTreeMap::new();
        for scope in &self.scopes {
            env.extend(scope.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }

    fn step(&mut self, instr: &Instr) -> Result<Flow, FlowFailure> {
        match instr {
            Instr::Push(value) => self.stack.push(Slot::Value(value.clone())),
            Instr::Load(name) => {
                let value = self.lookup(name)?;
                self.stack.push(Slot::Value(value));
            }
            Instr::Define(name) => {
                let value = self.pop()?;
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), value);
                }
            }
            Instr::Assign(name) => {
                let value = self.pop()?;
                let scope = self
                    .scopes
                    .iter_mut()
                    .rev()
                    .find(|scope| scope.contains_key(name))
                    .ok_or_else(|| FlowFailure::error(format!("No such variable: {name}")))?;
                scope.insert(name.clone(), value);
            }
            Instr::SetLast => self.last = self.pop()?,
            Instr::MakeClosure(block) => {
                let closure = Closure {
                    script: self.script.clone(),
                    block: *block,
                    env: self.captured(),
                };
                self.stack.push(Slot::Closure(closure));
            }
            Instr::MakeList(len) => {
                let items = self.pop_many(*len)?;
                self.stack.push(Slot::Value(Value::Array(items)));
            }
            Instr::MakeMap(keys) => {
                let values = self.pop_many(keys.len())?;
                let map: Map<String, Value> = keys.iter().cloned().zip(values).collect();
                self.stack.push(Slot::Value(Value::Object(map)));
            }
            Instr::Call {
                function,
                names,
                line,
            } => {
                let split = self.stack.len().checked_sub(names.len()).ok_or_else(|| {
                    FlowFailure::error("interpreter stack underflow")
                })?;
                let slots = self.stack.split_off(split);
                if function == PAUSE && names.is_empty() {
                    return Ok(Flow::Yield(ThreadTask::Pause));
                }
                let mut call = StepCall {
                    function: function.clone(),
                    args: Vec::new(),
                    bodies: Vec::new(),
                    line: *line,
                };
                for (name, slot) in names.iter().cloned().zip(slots) {
                    match slot {
                        Slot::Value(value) => call.args.push((name, value)),
                        Slot::Closure(closure) => call.bodies.push((name, closure)),
                    }
                }
                return Ok(Flow::Yield(ThreadTask::InvokeStep(call)));
            }
            Instr::Binary(op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.stack.push(Slot::Value(binary(*op, lhs, rhs)?));
            }
            Instr::Unary(op) => {
                let value = self.pop()?;
                let result = match op {
                    UnaryOp::Not => Value::Bool(!truthy(&value)),
                    UnaryOp::Neg => match value {
                        Value::Number(n) if n.is_i64() => {
                            match n.as_i64().and_then(i64::checked_neg) {
                                Some(negated) => Value::from(negated),
                                None => {
                                    return Err(FlowFailure::error(format!(
                                        "integer overflow negating {n}"
                                    )))
                                }
                            }
                        }
                        Value::Number(n) => Value::from(-n.as_f64().unwrap_or(0.0)),
                        other => {
                            return Err(FlowFailure::error(format!("cannot negate {other}")))
                        }
                    },
                };
                self.stack.push(Slot::Value(result));
            }
            Instr::Member(name) => {
                let target = self.pop()?;
                self.stack.push(Slot::Value(member(&target, name)));
            }
            Instr::Index => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = match (&target, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_u64()
                        .and_then(|i| items.get(i as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    (Value::Object(map), Value::String(key)) => {
                        map.get(key).cloned().unwrap_or(Value::Null)
                    }
                    _ => {
                        return Err(FlowFailure::error(format!(
                            "cannot index {target} with {index}"
                        )))
                    }
                };
                self.stack.push(Slot::Value(value));
            }
            Instr::Jump(target) => self.pc = *target,
            Instr::JumpIfFalse(target) => {
                if !truthy(&self.pop()?) {
                    self.pc = *target;
                }
            }
            Instr::JumpIfTrue(target) => {
                if truthy(&self.pop()?) {
                    self.pc = *target;
                }
            }
            Instr::EnterScope => self.scopes.push(BTreeMap::new()),
            Instr::ExitScope => {
                self.scopes.pop();
            }
            Instr::EnterTry { handler, binding } => self.handlers.push(Handler {
                pc: *handler,
                binding: binding.clone(),
                stack_depth: self.stack.len(),
                scope_depth: self.scopes.len(),
            }),
            Instr::ExitTry => {
                self.handlers.pop();
            }
            Instr::Return => return Ok(Flow::Return(self.pop()?)),
        }
        Ok(Flow::Continue)
    }

    fn pop_many(&mut self, len: usize) -> Result<Vec<Value>, FlowFailure> {
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.pop()?);
        }
        values.reverse();
        Ok(values)
    }
}

impl Continuable for Interpreter {
    fn run(&mut self, resume: Outcome) -> Yielded {
        let Some(code) = self.code.clone() else {
            return self.finish(Outcome::Abnormal(FlowFailure::error(format!(
                "code for script `{}` is not loaded",
                self.script
            ))));
        };
        match self.state {
            RunState::Done => {
                return Yielded::Done(Outcome::Abnormal(FlowFailure::error(
                    "program has already terminated",
                )))
            }
            RunState::Fresh => {
                if let Outcome::Abnormal(failure) = resume {
                    if let Some(done) = self.raise(failure) {
                        return done;
                    }
                }
            }
            RunState::Waiting => match resume {
                Outcome::Normal(value) => self.stack.push(Slot::Value(value)),
                Outcome::Abnormal(failure) => {
                    if let Some(done) = self.raise(failure) {
                        return done;
                    }
                }
            },
        }
        self.execute(&code)
    }

    fn is_resumable(&self) -> bool {
        self.state != RunState::Done
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("script", &self.script)
            .field("block", &self.block)
            .field("pc", &self.pc)
            .field("state", &self.state)
            .field("attached", &self.code.is_some())
            .finish()
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// 字符串拼接时的显示形式
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn member(target: &Value, name: &str) -> Value {
    match (target, name) {
        (Value::Object(map), _) => map.get(name).cloned().unwrap_or(Value::Null),
        (Value::Array(items), "size") => Value::from(items.len()),
        (Value::String(s), "size") => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, FlowFailure> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::NotEq => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => Value::from(a.wrapping_add(b)),
                _ => Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
            }),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (a @ Value::String(_), b) | (a, b @ Value::String(_)) => {
                Ok(Value::String(display(&a) + &display(&b)))
            }
            (a, b) => Err(FlowFailure::error(format!("cannot add {a} and {b}"))),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => Value::from(a.wrapping_sub(b)),
                _ => Value::from(a.as_f64().unwrap_or(0.0) - b.as_f64().unwrap_or(0.0)),
            }),
            (a, b) => Err(FlowFailure::error(format!("cannot subtract {b} from {a}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interpreter(source: &str) -> Interpreter {
        let code = Arc::new(CompiledScript::compile("main", source).unwrap());
        Interpreter::new(code, 0, BTreeMap::new())
    }

    fn expect_call(yielded: Yielded) -> StepCall {
        match yielded {
            Yielded::Task(ThreadTask::InvokeStep(call)) => call,
            other => panic!("expected a step call, got {other:?}"),
        }
    }

    #[test]
    fn evaluates_to_last_expression() {
        let mut program = interpreter("let x = 2; if (x == 2 || false) { x = x + 40 } x");
        match program.run(Outcome::null()) {
            Yielded::Done(outcome) => assert_eq!(outcome, Outcome::success(json!(42))),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!program.is_resumable());
    }

    #[test]
    fn step_result_flows_back_into_script() {
        let mut program = interpreter("let n = count(start: 1); echo('got ' + n)");
        let call = expect_call(program.run(Outcome::null()));
        assert_eq!(call.function, "count");
        assert_eq!(call.args, vec![(Some("start".to_string()), json!(1))]);

        let call = expect_call(program.run(Outcome::success(json!(5))));
        assert_eq!(call.args, vec![(None, json!("got 5"))]);
        assert!(program.is_resumable());
    }

    #[test]
    fn closures_capture_visible_variables() {
        let mut program = interpreter("let who = 'world'; withEnv(['A=1']) { echo(who) }");
        let call = expect_call(program.run(Outcome::null()));
        assert_eq!(call.bodies.len(), 1);
        assert_eq!(call.bodies[0].1.env.get("who"), Some(&json!("world")));
        assert_eq!(call.bodies[0].1.block, 1);
    }

    #[test]
    fn failures_are_catchable() {
        let mut program = interpreter("try { error('bad') } catch (e) { e.message }");
        expect_call(program.run(Outcome::null()));
        let outcome = match program.run(Outcome::failure(FlowFailure::error("bad"))) {
            Yielded::Done(outcome) => outcome,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(outcome, Outcome::success(json!("bad")));
    }

    #[test]
    fn uncaught_failure_terminates() {
        let mut program = interpreter("missing + 1");
        match program.run(Outcome::null()) {
            Yielded::Done(Outcome::Abnormal(failure)) => {
                assert!(failure.to_string().contains("No such variable: missing"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            program.run(Outcome::null()),
            Yielded::Done(Outcome::Abnormal(_))
        ));
    }

    #[test]
    fn negating_smallest_integer_fails() {
        let mut program = interpreter("let m = -9223372036854775807 - 1; -m");
        match program.run(Outcome::null()) {
            Yielded::Done(Outcome::Abnormal(failure)) => {
                assert!(failure.to_string().contains("integer overflow negating"), "{failure}")
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut program = interpreter("let m = 7; -m");
        match program.run(Outcome::null()) {
            Yielded::Done(outcome) => assert_eq!(outcome, Outcome::success(json!(-7))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pause_yields_intrinsic() {
        let mut program = interpreter("let v = pause(); v + 1");
        assert!(matches!(
            program.run(Outcome::null()),
            Yielded::Task(ThreadTask::Pause)
        ));
        let json = serde_json::to_string(&program).unwrap();
        let mut restored: Interpreter = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_attached());
        restored.attach(Arc::new(CompiledScript::compile("main", "let v = pause(); v + 1").unwrap()));
        match restored.run(Outcome::success(json!(41))) {
            Yielded::Done(outcome) => assert_eq!(outcome, Outcome::success(json!(42))),
            other => panic!("unexpected {other:?}"),
        }
    }
}
