//! Source text rendering
//!
//! [`Output`] is the indentation-aware text sink; [`Printer`] renders a
//! statement tree into it. Nested functions are looked up in a
//! [`FunctionTable`] and printed inline where their closure is created, with
//! upvalue names supplied by the enclosing function.

use crate::ast::expression::{Closure, Expression, Precedence, TableEntry, UpvalueRef};
use crate::ast::statement::{FunctionBody, LocalDeclaration, Statement};
use crate::ast::target::Target;
use crate::chunk::{Constant, FunctionId, UnOp};
use crate::error::Error;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Decompilation outcome of every prototype in a chunk.
pub type FunctionTable = BTreeMap<FunctionId, std::result::Result<FunctionBody, Error>>;

/// Indentation-aware text sink.
#[derive(Debug)]
pub struct Output {
    unit: String,
    depth: usize,
    buffer: String,
    line_start: bool,
}

impl Output {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            depth: 0,
            buffer: String::new(),
            line_start: true,
        }
    }

    pub fn print(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.line_start {
            for _ in 0..self.depth {
                self.buffer.push_str(&self.unit);
            }
            self.line_start = false;
        }
        self.buffer.push_str(text);
    }

    pub fn println(&mut self, text: &str) {
        self.print(text);
        self.newline();
    }

    pub fn newline(&mut self) {
        self.buffer.push('\n');
        self.line_start = true;
    }

    /// End the previous line with `;` so the next one cannot continue it.
    pub fn separate(&mut self) {
        if self.line_start && self.buffer.ends_with('\n') {
            self.buffer.pop();
            self.buffer.push_str(";\n");
        }
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn dedent(&mut self) {
        debug_assert!(self.depth > 0, "dedent without matching indent");
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn finish(self) -> String {
        self.buffer
    }
}

/// Renders statement trees as Lua source.
pub struct Printer<'a> {
    out: Output,
    functions: &'a FunctionTable,
    elseif_chains: bool,
    /// Upvalue names of the functions being printed, innermost last.
    upvalues: Vec<Vec<String>>,
}

impl<'a> Printer<'a> {
    pub fn new(functions: &'a FunctionTable, indent: &str, elseif_chains: bool) -> Self {
        Self {
            out: Output::new(indent),
            functions,
            elseif_chains,
            upvalues: Vec::new(),
        }
    }

    pub fn finish(self) -> String {
        self.out.finish()
    }

    /// Print a function's body as top-level chunk code.
    pub fn chunk(&mut self, body: &FunctionBody, upvalue_names: Vec<String>) {
        self.upvalues.push(upvalue_names);
        self.statements(&body.body);
        self.upvalues.pop();
    }

    /// Print a function as a global function statement, `function name(...) ... end`.
    pub fn function_statement(&mut self, name: &str, body: &FunctionBody, upvalue_names: Vec<String>) {
        self.out.print("function ");
        self.out.print(name);
        self.function_tail(body, upvalue_names);
        self.out.newline();
    }

    pub fn comment(&mut self, text: &str) {
        self.out.print("-- ");
        self.out.println(text);
    }

    fn upvalue_name(&self, index: usize) -> String {
        self.upvalues
            .last()
            .and_then(|names| names.get(index))
            .cloned()
            .unwrap_or_else(|| format!("upvalue_{}", index))
    }

    /// Parameter list, body and `end`.
    fn function_tail(&mut self, body: &FunctionBody, upvalue_names: Vec<String>) {
        let mut params = body.params.clone();
        if body.is_vararg {
            params.push("...".to_string());
        }
        self.out.print("(");
        self.out.print(&params.join(", "));
        self.out.print(")");
        self.out.newline();
        self.upvalues.push(upvalue_names);
        self.out.indent();
        self.statements(&body.body);
        self.out.dedent();
        self.upvalues.pop();
        self.out.print("end");
    }

    fn closure(&mut self, closure: &Closure, prefix: &str) {
        let functions = self.functions;
        match functions.get(&closure.function) {
            Some(Ok(body)) => {
                let names = closure
                    .upvalues
                    .iter()
                    .map(|upvalue| match upvalue {
                        UpvalueRef::Local(name) => name.clone(),
                        UpvalueRef::Parent(index) => self.upvalue_name(*index),
                    })
                    .collect();
                self.out.print(prefix);
                self.function_tail(body, names);
            }
            _ => {
                self.out.print(prefix);
                self.out.print("(...) --[[ decompilation failed ]] end");
            }
        }
    }

    pub fn statements(&mut self, statements: &[Statement]) {
        for (i, statement) in statements.iter().enumerate() {
            if i > 0 && opens_with_paren(statement) {
                self.out.separate();
            }
            self.statement(statement);
        }
    }

    fn block(&mut self, statements: &[Statement]) {
        self.out.indent();
        self.statements(statements);
        self.out.dedent();
    }

    pub fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Local {
                declarations,
                values,
            } => {
                self.out.print("local ");
                self.declarations(declarations);
                if !values.is_empty() {
                    self.out.print(" = ");
                    self.expression_list(values, values.len() < declarations.len());
                }
                self.out.newline();
            }
            Statement::Assign { targets, values } => {
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        self.out.print(", ");
                    }
                    self.target(target);
                }
                self.out.print(" = ");
                self.expression_list(values, values.len() < targets.len());
                self.out.newline();
            }
            Statement::Call(call) => {
                self.call(call);
                self.out.newline();
            }
            Statement::Return(values) => {
                self.out.print("return");
                if !values.is_empty() {
                    self.out.print(" ");
                    self.expression_list(values, true);
                }
                self.out.newline();
            }
            Statement::Break => self.out.println("break"),
            Statement::LocalFunction { name, function } => {
                self.closure(function, &format!("local function {}", name));
                self.out.newline();
            }
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                self.out.print("if ");
                self.if_tail(condition, then_body, else_body.as_deref());
            }
            Statement::While { condition, body } => {
                self.out.print("while ");
                self.expression(condition);
                self.out.println(" do");
                self.block(body);
                self.out.println("end");
            }
            Statement::Repeat { body, condition } => {
                self.out.println("repeat");
                self.block(body);
                self.out.print("until ");
                self.expression(condition);
                self.out.newline();
            }
            Statement::NumericFor {
                variable,
                start,
                stop,
                step,
                body,
            } => {
                self.out.print("for ");
                self.out.print(variable);
                self.out.print(" = ");
                self.expression(start);
                self.out.print(", ");
                self.expression(stop);
                if !step.is_integer(1) {
                    self.out.print(", ");
                    self.expression(step);
                }
                self.out.println(" do");
                self.block(body);
                self.out.println("end");
            }
            Statement::GenericFor {
                variables,
                iterators,
                body,
            } => {
                self.out.print("for ");
                self.out.print(&variables.join(", "));
                self.out.print(" in ");
                self.expression_list(iterators, true);
                self.out.println(" do");
                self.block(body);
                self.out.println("end");
            }
            Statement::Do(body) => {
                self.out.println("do");
                self.block(body);
                self.out.println("end");
            }
            Statement::Failure { message } => {
                self.comment(&format!("decompilation failed: {}", message));
            }
        }
    }

    fn if_tail(&mut self, condition: &Expression, then_body: &[Statement], else_body: Option<&[Statement]>) {
        self.expression(condition);
        self.out.println(" then");
        self.block(then_body);
        match else_body {
            None => self.out.println("end"),
            Some(
                [Statement::If {
                    condition,
                    then_body,
                    else_body,
                }],
            ) if self.elseif_chains => {
                self.out.print("elseif ");
                self.if_tail(condition, then_body, else_body.as_deref());
            }
            Some(else_body) => {
                self.out.println("else");
                self.block(else_body);
                self.out.println("end");
            }
        }
    }

    fn declarations(&mut self, declarations: &[LocalDeclaration]) {
        for (i, declaration) in declarations.iter().enumerate() {
            if i > 0 {
                self.out.print(", ");
            }
            self.out.print(&declaration.name);
            if let Some(attribute) = declaration.attribute {
                self.out.print(&format!(" <{}>", attribute.keyword()));
            }
        }
    }

    fn target(&mut self, target: &Target) {
        match target {
            Target::Local(name) | Target::Global(name) => self.out.print(name),
            Target::Upvalue(index) => {
                let name = self.upvalue_name(*index);
                self.out.print(&name);
            }
            Target::Index { table, key } => self.index(table, key),
        }
    }

    /// Comma-separated expressions. In an `open` list a truncated trailing
    /// call or vararg keeps its parentheses.
    fn expression_list(&mut self, expressions: &[Expression], open: bool) {
        for (i, expression) in expressions.iter().enumerate() {
            if i > 0 {
                self.out.print(", ");
            }
            if open && i + 1 == expressions.len() && expression.is_truncated() {
                self.out.print("(");
                self.expression(expression);
                self.out.print(")");
            } else {
                self.expression(expression);
            }
        }
    }

    fn prefix(&mut self, expression: &Expression) {
        if expression.is_prefix() {
            self.expression(expression);
        } else {
            self.out.print("(");
            self.expression(expression);
            self.out.print(")");
        }
    }

    fn index(&mut self, table: &Expression, key: &Expression) {
        self.prefix(table);
        match key.as_identifier() {
            Some(name) => {
                self.out.print(".");
                self.out.print(name);
            }
            None => {
                self.out.print("[");
                self.expression(key);
                self.out.print("]");
            }
        }
    }

    fn call(&mut self, call: &crate::ast::expression::CallExpression) {
        self.prefix(&call.function);
        if let Some(method) = &call.method {
            self.out.print(":");
            self.out.print(method);
        }
        self.out.print("(");
        self.expression_list(&call.args, true);
        self.out.print(")");
    }

    fn operand(&mut self, expression: &Expression, min: Precedence) {
        if expression.precedence() < min {
            self.out.print("(");
            self.expression(expression);
            self.out.print(")");
        } else {
            self.expression(expression);
        }
    }

    pub fn expression(&mut self, expression: &Expression) {
        match expression {
            Expression::Constant(constant) => {
                let text = constant_text(constant);
                self.out.print(&text);
            }
            Expression::Local(name) | Expression::Global(name) => self.out.print(name),
            Expression::Upvalue(index) => {
                let name = self.upvalue_name(*index);
                self.out.print(&name);
            }
            Expression::Index { table, key } => self.index(table, key),
            Expression::Method { object, name } => {
                self.prefix(object);
                self.out.print(".");
                self.out.print(name);
            }
            Expression::SelfArgument => self.out.print("self"),
            Expression::Unary { op, operand } => {
                let symbol = match op {
                    UnOp::Minus => "-",
                    UnOp::Not => "not ",
                    UnOp::Len => "#",
                    UnOp::BNot => "~",
                };
                self.out.print(symbol);
                let starts_with_minus = matches!(
                    operand.as_ref(),
                    Expression::Unary { op: UnOp::Minus, .. }
                ) || (operand.is_constant() && operand.precedence() == Precedence::UNARY);
                if *op == UnOp::Minus && starts_with_minus {
                    self.out.print("(");
                    self.expression(operand);
                    self.out.print(")");
                } else {
                    self.operand(operand, Precedence::UNARY);
                }
            }
            Expression::Binary { op, left, right } => {
                let precedence = op.precedence();
                let (left_min, right_min) = if op.is_right_associative() {
                    (Precedence(precedence.0 + 1), precedence)
                } else if op.is_associative() {
                    (precedence, precedence)
                } else {
                    (precedence, Precedence(precedence.0 + 1))
                };
                self.operand(left, left_min);
                self.out.print(" ");
                self.out.print(op.symbol());
                self.out.print(" ");
                self.operand(right, right_min);
            }
            Expression::Concat(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.print(" .. ");
                    }
                    let min = if i + 1 == items.len() {
                        Precedence::CONCAT
                    } else {
                        Precedence(Precedence::CONCAT.0 + 1)
                    };
                    self.operand(item, min);
                }
            }
            Expression::Call(call) => self.call(call),
            Expression::VarArg { .. } => self.out.print("..."),
            Expression::Table(table) => {
                self.out.print("{");
                let last = table.entries.len();
                for (i, entry) in table.entries.iter().enumerate() {
                    if i > 0 {
                        self.out.print(", ");
                    }
                    match entry {
                        TableEntry::Positional(value) => {
                            self.expression_list(std::slice::from_ref(value), i + 1 == last);
                        }
                        TableEntry::Keyed(key, value) => {
                            match key.as_identifier() {
                                Some(name) => self.out.print(name),
                                None => {
                                    self.out.print("[");
                                    self.expression(key);
                                    self.out.print("]");
                                }
                            }
                            self.out.print(" = ");
                            self.expression(value);
                        }
                    }
                }
                self.out.print("}");
            }
            Expression::Closure(closure) => self.closure(closure, "function"),
        }
    }
}

/// Lua literal for a constant.
/// Whether the statement's text starts with `(`, which Lua would read as a
/// call on the end of the line before it.
fn opens_with_paren(statement: &Statement) -> bool {
    match statement {
        Statement::Call(call) => !call.function.is_prefix(),
        Statement::Assign { targets, .. } => {
            matches!(targets.first(), Some(Target::Index { table, .. }) if !table.is_prefix())
        }
        _ => false,
    }
}

pub fn constant_text(constant: &Constant) -> String {
    match constant {
        Constant::Nil => "nil".to_string(),
        Constant::Boolean(value) => value.to_string(),
        Constant::Integer(i64::MIN) => "math.mininteger".to_string(),
        Constant::Integer(value) => value.to_string(),
        Constant::Float(value) if value.is_nan() => "(0/0)".to_string(),
        Constant::Float(value) if value.is_infinite() => {
            if value.is_sign_positive() {
                "math.huge".to_string()
            } else {
                "-math.huge".to_string()
            }
        }
        Constant::Float(value) => format!("{:?}", value),
        Constant::String(text) => quote(text.as_bytes()),
    }
}

/// Double-quoted Lua string literal.
///
/// Valid UTF-8 sequences are kept; control characters and stray bytes are
/// written as decimal escapes.
pub fn quote(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    let mut rest = bytes;
    while !rest.is_empty() {
        let (valid, invalid) = match std::str::from_utf8(rest) {
            Ok(text) => (text, 0),
            Err(err) => {
                let (head, _) = rest.split_at(err.valid_up_to());
                let bad = err.error_len().unwrap_or(rest.len() - head.len());
                (std::str::from_utf8(head).unwrap_or_default(), bad)
            }
        };
        for c in valid.chars() {
            escape_char(&mut out, c);
        }
        rest = &rest[valid.len()..];
        for byte in &rest[..invalid] {
            let _ = write!(out, "\\{:03}", byte);
        }
        rest = &rest[invalid..];
    }
    out.push('"');
    out
}

fn escape_char(out: &mut String, c: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '"' => out.push_str("\\\""),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        ' '..='~' => out.push(c),
        c if (c as u32) < 0x80 => {
            let _ = write!(out, "\\{:03}", c as u32);
        }
        c => out.push(c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expression::{BinaryOp, CallExpression};

    fn render(statements: &[Statement]) -> String {
        let table = FunctionTable::new();
        let mut printer = Printer::new(&table, "  ", true);
        printer.statements(statements);
        printer.finish()
    }

    fn expr(expression: &Expression) -> String {
        let table = FunctionTable::new();
        let mut printer = Printer::new(&table, "  ", true);
        printer.expression(expression);
        printer.finish()
    }

    fn local(name: &str) -> Expression {
        Expression::Local(name.to_string())
    }

    #[test]
    fn test_output_indentation() {
        let mut out = Output::new("\t");
        out.println("a");
        out.indent();
        out.print("b");
        out.print("c");
        out.newline();
        out.dedent();
        out.println("d");
        assert_eq!(out.finish(), "a\n\tbc\nd\n");
    }

    #[test]
    fn test_precedence_parentheses() {
        let sum = Expression::binary(BinaryOp::Add, local("a"), local("b"));
        let product = Expression::binary(BinaryOp::Mul, sum.clone(), local("c"));
        assert_eq!(expr(&product), "(a + b) * c");
        let difference = Expression::binary(BinaryOp::Sub, local("a"), sum);
        assert_eq!(expr(&difference), "a - (a + b)");
        let power = Expression::binary(
            BinaryOp::Pow,
            local("a"),
            Expression::binary(BinaryOp::Pow, local("b"), local("c")),
        );
        assert_eq!(expr(&power), "a ^ b ^ c");
        let negative_base = Expression::binary(BinaryOp::Pow, Expression::integer(-2), local("x"));
        assert_eq!(expr(&negative_base), "(-2) ^ x");
    }

    #[test]
    fn test_logical_chains_without_parentheses() {
        let chain = Expression::binary(
            BinaryOp::And,
            local("a"),
            Expression::binary(BinaryOp::And, local("b"), local("c")),
        );
        assert_eq!(expr(&chain), "a and b and c");
        let mixed = Expression::binary(
            BinaryOp::And,
            local("a"),
            Expression::binary(BinaryOp::Or, local("b"), local("c")),
        );
        assert_eq!(expr(&mixed), "a and (b or c)");
    }

    #[test]
    fn test_unary_minus_of_negative() {
        let neg = Expression::unary(UnOp::Minus, Expression::integer(-1));
        assert_eq!(expr(&neg), "-(-1)");
        let not = Expression::unary(UnOp::Not, Expression::binary(BinaryOp::Lt, local("a"), local("b")));
        assert_eq!(expr(&not), "not (a < b)");
    }

    #[test]
    fn test_literals() {
        assert_eq!(constant_text(&Constant::Float(f64::INFINITY)), "math.huge");
        assert_eq!(constant_text(&Constant::Float(f64::NAN)), "(0/0)");
        assert_eq!(constant_text(&Constant::Float(1.0)), "1.0");
        assert_eq!(constant_text(&Constant::Float(0.5)), "0.5");
        assert_eq!(constant_text(&Constant::Integer(42)), "42");
        assert_eq!(quote(b"a\"b\n\x01"), "\"a\\\"b\\n\\001\"");
    }

    #[test]
    fn test_non_utf8_bytes_are_escaped() {
        assert_eq!(quote(b"\xffab"), "\"\\255ab\"");
        assert_eq!(quote("caf\u{e9}".as_bytes()), "\"caf\u{e9}\"");
        assert_eq!(quote(b"caf\xe9"), "\"caf\\233\"");
        assert_eq!(
            constant_text(&Constant::String(vec![b'x', 0xC3].into())),
            "\"x\\195\""
        );
    }

    #[test]
    fn test_index_and_method_call() {
        let field = Expression::index(Expression::Global("t".into()), Expression::string("x"));
        assert_eq!(expr(&field), "t.x");
        let keyword = Expression::index(Expression::Global("t".into()), Expression::string("end"));
        assert_eq!(expr(&keyword), "t[\"end\"]");
        let call = Expression::Call(Box::new(CallExpression {
            function: Expression::string("abc"),
            method: Some("upper".into()),
            args: vec![],
            multi: false,
        }));
        assert_eq!(expr(&call), "(\"abc\"):upper()");
    }

    #[test]
    fn test_parenthesized_callee_ends_previous_line() {
        let call = |function: Expression| {
            Statement::Call(CallExpression {
                function,
                method: None,
                args: vec![],
                multi: false,
            })
        };
        let statements = vec![
            Statement::assign(Target::Global("x".into()), Expression::Global("f".into())),
            call(Expression::string("abc")),
            call(Expression::Global("g".into())),
        ];
        assert_eq!(render(&statements), "x = f;\n(\"abc\")()\ng()\n");
        assert_eq!(render(&statements[1..2]), "(\"abc\")()\n");
    }

    #[test]
    fn test_truncated_call_in_open_list() {
        let inner = Expression::Call(Box::new(CallExpression {
            function: Expression::Global("f".into()),
            method: None,
            args: vec![],
            multi: false,
        }));
        let text = render(&[Statement::Return(vec![inner.clone()])]);
        assert_eq!(text, "return (f())\n");
        let text = render(&[Statement::local("x", Some(inner))]);
        assert_eq!(text, "local x = f()\n");
    }

    #[test]
    fn test_numeric_for_step() {
        let body = vec![];
        let with_default = Statement::NumericFor {
            variable: "i".into(),
            start: Expression::integer(0),
            stop: Expression::integer(9),
            step: Expression::integer(1),
            body: body.clone(),
        };
        assert_eq!(render(&[with_default]), "for i = 0, 9 do\nend\n");
        let with_step = Statement::NumericFor {
            variable: "i".into(),
            start: Expression::integer(10),
            stop: Expression::integer(1),
            step: Expression::integer(-1),
            body,
        };
        assert_eq!(render(&[with_step]), "for i = 10, 1, -1 do\nend\n");
    }

    #[test]
    fn test_elseif_chain() {
        let inner = Statement::If {
            condition: local("b"),
            then_body: vec![Statement::Break],
            else_body: None,
        };
        let outer = Statement::If {
            condition: local("a"),
            then_body: vec![Statement::Return(vec![])],
            else_body: Some(vec![inner]),
        };
        assert_eq!(
            render(&[outer]),
            "if a then\n  return\nelseif b then\n  break\nend\n"
        );
    }

    #[test]
    fn test_failed_closure_placeholder() {
        let closure = Expression::Closure(Closure {
            function: FunctionId::from_path(vec![0]),
            upvalues: vec![],
        });
        assert_eq!(expr(&closure), "function(...) --[[ decompilation failed ]] end");
    }

    #[test]
    fn test_closure_with_parent_upvalue_names() {
        let mut table = FunctionTable::new();
        table.insert(
            FunctionId::from_path(vec![0]),
            Ok(FunctionBody {
                params: vec!["a".into()],
                is_vararg: true,
                body: vec![Statement::Return(vec![Expression::Upvalue(0)])],
                upvalue_names: vec![None],
            }),
        );
        let closure = Expression::Closure(Closure {
            function: FunctionId::from_path(vec![0]),
            upvalues: vec![UpvalueRef::Local("counter".into())],
        });
        let mut printer = Printer::new(&table, "  ", true);
        printer.statement(&Statement::Return(vec![closure]));
        assert_eq!(
            printer.finish(),
            "return function(a, ...)\n  return counter\nend\n"
        );
    }
}
