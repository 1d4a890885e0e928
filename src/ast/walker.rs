//! Read-only traversal of statement trees
//!
//! [`walk_statement`] visits a statement, then the expressions it owns, then
//! its nested statements, so a walker sees nodes in source order. The only
//! exception is `repeat ... until`, whose condition follows the body.

use crate::ast::expression::{Expression, TableEntry};
use crate::ast::statement::Statement;
use crate::ast::target::Target;
use crate::chunk::FunctionId;

pub trait Walker {
    fn visit_statement(&mut self, _statement: &Statement) {}
    fn visit_expression(&mut self, _expression: &Expression) {}
}

pub fn walk_block<W: Walker + ?Sized>(walker: &mut W, statements: &[Statement]) {
    for statement in statements {
        walk_statement(walker, statement);
    }
}

pub fn walk_statement<W: Walker + ?Sized>(walker: &mut W, statement: &Statement) {
    walker.visit_statement(statement);
    match statement {
        Statement::Local { values, .. } | Statement::Return(values) => {
            walk_expressions(walker, values);
        }
        Statement::Assign { targets, values } => {
            for target in targets {
                if let Target::Index { table, key } = target {
                    walk_expression(walker, table);
                    walk_expression(walker, key);
                }
            }
            walk_expressions(walker, values);
        }
        Statement::Call(call) => {
            walk_expression(walker, &call.function);
            walk_expressions(walker, &call.args);
        }
        Statement::Break | Statement::Failure { .. } => {}
        Statement::LocalFunction { function, .. } => {
            walk_expression(walker, &Expression::Closure(function.clone()));
        }
        Statement::If {
            condition,
            then_body,
            else_body,
        } => {
            walk_expression(walker, condition);
            walk_block(walker, then_body);
            if let Some(else_body) = else_body {
                walk_block(walker, else_body);
            }
        }
        Statement::While { condition, body } => {
            walk_expression(walker, condition);
            walk_block(walker, body);
        }
        Statement::Repeat { body, condition } => {
            walk_block(walker, body);
            walk_expression(walker, condition);
        }
        Statement::NumericFor {
            start,
            stop,
            step,
            body,
            ..
        } => {
            walk_expression(walker, start);
            walk_expression(walker, stop);
            walk_expression(walker, step);
            walk_block(walker, body);
        }
        Statement::GenericFor {
            iterators, body, ..
        } => {
            walk_expressions(walker, iterators);
            walk_block(walker, body);
        }
        Statement::Do(body) => walk_block(walker, body),
    }
}

fn walk_expressions<W: Walker + ?Sized>(walker: &mut W, expressions: &[Expression]) {
    for expression in expressions {
        walk_expression(walker, expression);
    }
}

pub fn walk_expression<W: Walker + ?Sized>(walker: &mut W, expression: &Expression) {
    walker.visit_expression(expression);
    match expression {
        Expression::Index { table, key } => {
            walk_expression(walker, table);
            walk_expression(walker, key);
        }
        Expression::Method { object, .. } => walk_expression(walker, object),
        Expression::Unary { operand, .. } => walk_expression(walker, operand),
        Expression::Binary { left, right, .. } => {
            walk_expression(walker, left);
            walk_expression(walker, right);
        }
        Expression::Concat(items) => walk_expressions(walker, items),
        Expression::Call(call) => {
            walk_expression(walker, &call.function);
            walk_expressions(walker, &call.args);
        }
        Expression::Table(table) => {
            for entry in &table.entries {
                match entry {
                    TableEntry::Positional(value) => walk_expression(walker, value),
                    TableEntry::Keyed(key, value) => {
                        walk_expression(walker, key);
                        walk_expression(walker, value);
                    }
                }
            }
        }
        Expression::Constant(_)
        | Expression::Local(_)
        | Expression::Global(_)
        | Expression::Upvalue(_)
        | Expression::SelfArgument
        | Expression::VarArg { .. }
        | Expression::Closure(_) => {}
    }
}

/// Nested functions referenced by closures, in source order.
#[derive(Default)]
pub struct ClosureCollector {
    pub functions: Vec<FunctionId>,
}

impl Walker for ClosureCollector {
    fn visit_expression(&mut self, expression: &Expression) {
        if let Expression::Closure(closure) = expression {
            self.functions.push(closure.function.clone());
        }
    }
}

/// Statement count, nested statements included.
#[derive(Default)]
pub struct StatementCounter {
    pub count: usize,
}

impl Walker for StatementCounter {
    fn visit_statement(&mut self, _statement: &Statement) {
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expression::{CallExpression, Closure};

    #[derive(Default)]
    struct Trace(Vec<String>);

    impl Walker for Trace {
        fn visit_statement(&mut self, statement: &Statement) {
            let name = match statement {
                Statement::Repeat { .. } => "repeat",
                Statement::Call(_) => "call",
                Statement::Break => "break",
                _ => "other",
            };
            self.0.push(name.to_string());
        }

        fn visit_expression(&mut self, expression: &Expression) {
            if let Expression::Global(name) = expression {
                self.0.push(name.clone());
            }
        }
    }

    #[test]
    fn test_repeat_condition_follows_body() {
        let body = vec![Statement::Call(CallExpression {
            function: Expression::Global("f".into()),
            method: None,
            args: vec![],
            multi: false,
        })];
        let tree = vec![Statement::Repeat {
            body,
            condition: Expression::Global("done".into()),
        }];
        let mut trace = Trace::default();
        walk_block(&mut trace, &tree);
        assert_eq!(trace.0, vec!["repeat", "call", "f", "done"]);
    }

    #[test]
    fn test_closure_collector() {
        let closure = Closure {
            function: FunctionId::from_path(vec![1]),
            upvalues: vec![],
        };
        let tree = vec![
            Statement::LocalFunction {
                name: "f".into(),
                function: Closure {
                    function: FunctionId::from_path(vec![0]),
                    upvalues: vec![],
                },
            },
            Statement::Return(vec![Expression::Closure(closure)]),
        ];
        let mut collector = ClosureCollector::default();
        walk_block(&mut collector, &tree);
        assert_eq!(
            collector.functions,
            vec![FunctionId::from_path(vec![0]), FunctionId::from_path(vec![1])]
        );

        let mut counter = StatementCounter::default();
        walk_block(&mut counter, &tree);
        assert_eq!(counter.count, 2);
    }
}
