use serde_json::Value;

use crate::error::{FlowError, Result};

use super::ast::{BinaryOp, Call, Expr, Stmt, UnaryOp};
use super::parser::parse;

/// 解释器指令
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Push(Value),
    Load(String),
    Define(String),
    Assign(String),
    /// 弹出栈顶，作为代码块的最近结果
    SetLast,
    MakeClosure(usize),
    MakeList(usize),
    MakeMap(Vec<String>),
    Call {
        function: String,
        names: Vec<Option<String>>,
        line: usize,
    },
    Binary(BinaryOp),
    Unary(UnaryOp),
    Member(String),
    Index,
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    EnterScope,
    ExitScope,
    EnterTry {
        handler: usize,
        binding: String,
    },
    ExitTry,
    Return,
}

/// 编译后的脚本：0 号代码块是脚本主体，其余为闭包体
#[derive(Debug)]
pub struct CompiledScript {
    pub name: String,
    pub blocks: Vec<Vec<Instr>>,
}

impl CompiledScript {
    pub fn compile(name: impl Into<String>, source: &str) -> Result<Self> {
        let program = parse(source)?;
        let mut compiler = Compiler { blocks: Vec::new() };
        compiler.blocks.push(Vec::new());
        let main = compiler.compile_block(&program)?;
        compiler.blocks[0] = main;
        Ok(CompiledScript {
            name: name.into(),
            blocks: compiler.blocks,
        })
    }

    pub fn block(&self, index: usize) -> Option<&[Instr]> {
        self.blocks.get(index).map(Vec::as_slice)
    }
}

struct Compiler {
    blocks: Vec<Vec<Instr>>,
}

impl Compiler {
    fn compile_block(&mut self, statements: &[Stmt]) -> Result<Vec<Instr>> {
        let mut code = Vec::new();
        for statement in statements {
            self.statement(statement, &mut code)?;
        }
        Ok(code)
    }

    fn scoped(&mut self, statements: &[Stmt], code: &mut Vec<Instr>) -> Result<()> {
        code.push(Instr::EnterScope);
        for statement in statements {
            self.statement(statement, code)?;
        }
        code.push(Instr::ExitScope);
        Ok(())
    }

    fn statement(&mut self, statement: &Stmt, code: &mut Vec<Instr>) -> Result<()> {
        match statement {
            Stmt::Let { name, value } => {
                self.expr(value, code)?;
                code.push(Instr::Define(name.clone()));
            }
            Stmt::Assign { name, value } => {
                self.expr(value, code)?;
                code.push(Instr::Assign(name.clone()));
            }
            Stmt::Expr(expr) => {
                self.expr(expr, code)?;
                code.push(Instr::SetLast);
            }
            Stmt::Return(value) => {
                match value {
                    Some(value) => self.expr(value, code)?,
                    None => code.push(Instr::Push(Value::Null)),
                }
                code.push(Instr::Return);
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr(condition, code)?;
                let to_else = code.len();
                code.push(Instr::JumpIfFalse(0));
                self.scoped(then_branch, code)?;
                let to_end = code.len();
                code.push(Instr::Jump(0));
                code[to_else] = Instr::JumpIfFalse(code.len());
                self.scoped(else_branch, code)?;
                code[to_end] = Instr::Jump(code.len());
            }
            Stmt::Try {
                body,
                binding,
                handler,
            } => {
                let enter = code.len();
                code.push(Instr::EnterTry {
                    handler: 0,
                    binding: binding.clone(),
                });
                self.scoped(body, code)?;
                code.push(Instr::ExitTry);
                let to_end = code.len();
                code.push(Instr::Jump(0));
                code[enter] = Instr::EnterTry {
                    handler: code.len(),
                    binding: binding.clone(),
                };
                // 进入 handler 时解释器已压入绑定异常的作用域
                for statement in handler {
                    self.statement(statement, code)?;
                }
                code.push(Instr::ExitScope);
                code[to_end] = Instr::Jump(code.len());
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr, code: &mut Vec<Instr>) -> Result<()> {
        match expr {
            Expr::Literal(value) => code.push(Instr::Push(value.clone())),
            Expr::Var(name) => code.push(Instr::Load(name.clone())),
            Expr::List(items) => {
                for item in items {
                    self.expr(item, code)?;
                }
                code.push(Instr::MakeList(items.len()));
            }
            Expr::Map(entries) => {
                for (_, value) in entries {
                    self.expr(value, code)?;
                }
                code.push(Instr::MakeMap(
                    entries.iter().map(|(key, _)| key.clone()).collect(),
                ));
            }
            Expr::Unary { op, expr } => {
                self.expr(expr, code)?;
                code.push(Instr::Unary(*op));
            }
            Expr::Binary { op, lhs, rhs } => {
                self.expr(lhs, code)?;
                self.expr(rhs, code)?;
                code.push(Instr::Binary(*op));
            }
            Expr::And(lhs, rhs) => self.short_circuit(lhs, rhs, false, code)?,
            Expr::Or(lhs, rhs) => self.short_circuit(lhs, rhs, true, code)?,
            Expr::Member { target, name } => {
                self.expr(target, code)?;
                code.push(Instr::Member(name.clone()));
            }
            Expr::Index { target, index } => {
                self.expr(target, code)?;
                self.expr(index, code)?;
                code.push(Instr::Index);
            }
            Expr::Call(call) => self.call(call, code)?,
            Expr::Closure { span, .. } => {
                return Err(FlowError::Parse {
                    message: "a block can only be passed as a step argument".to_string(),
                    span: *span,
                })
            }
        }
        Ok(())
    }

    /// `a && b` 与 `a || b`，结果总是布尔值
    fn short_circuit(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        is_or: bool,
        code: &mut Vec<Instr>,
    ) -> Result<()> {
        let mut exits = Vec::new();
        for operand in [lhs, rhs] {
            self.expr(operand, code)?;
            exits.push(code.len());
            code.push(Instr::Jump(0));
        }
        code.push(Instr::Push(Value::Bool(!is_or)));
        let to_end = code.len();
        code.push(Instr::Jump(0));
        let decided = code.len();
        code.push(Instr::Push(Value::Bool(is_or)));
        let end = code.len();
        for exit in exits {
            code[exit] = if is_or {
                Instr::JumpIfTrue(decided)
            } else {
                Instr::JumpIfFalse(decided)
            };
        }
        code[to_end] = Instr::Jump(end);
        Ok(())
    }

    fn call(&mut self, call: &Call, code: &mut Vec<Instr>) -> Result<()> {
        for arg in &call.args {
            match &arg.value {
                Expr::Closure { body, .. } => {
                    let index = self.blocks.len();
                    self.blocks.push(Vec::new());
                    let block = self.compile_block(body)?;
                    self.blocks[index] = block;
                    code.push(Instr::MakeClosure(index));
                }
                other => self.expr(other, code)?,
            }
        }
        code.push(Instr::Call {
            function: call.name.clone(),
            names: call.args.iter().map(|arg| arg.name.clone()).collect(),
            line: call.line,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_get_their_own_blocks() {
        let script = CompiledScript::compile("main", "withEnv(['A=1']) { echo('x') }").unwrap();
        assert_eq!(script.blocks.len(), 2);
        assert!(script.blocks[0].contains(&Instr::MakeClosure(1)));
        assert!(matches!(
            script.blocks[1].as_slice(),
            [Instr::Push(_), Instr::Call { .. }, Instr::SetLast]
        ));
    }

    #[test]
    fn rejects_block_outside_call() {
        let err = CompiledScript::compile("main", "let x = [{ echo('x') }]").unwrap_err();
        assert!(err.to_string().contains("step argument"));
    }
}
