use crate::model::{derivative_name, Model, SimulationState, VariableKind};
use crate::traits::DerivativeSource;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Built-in functions callable from an equation's right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log10,
    Log2,
    Sqrt,
    Abs,
    Sign,
    Floor,
    Ceil,
    Min,
    Max,
    Pow,
    Atan2,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "log10" => Function::Log10,
            "log2" => Function::Log2,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "sign" => Function::Sign,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "min" => Function::Min,
            "max" => Function::Max,
            "pow" => Function::Pow,
            "atan2" => Function::Atan2,
            _ => return None,
        };
        Some(function)
    }

    pub fn arity(self) -> usize {
        match self {
            Function::Min | Function::Max | Function::Pow | Function::Atan2 => 2,
            _ => 1,
        }
    }

    /// `args.len()` must equal `self.arity()`.
    fn apply(self, args: &[f64]) -> f64 {
        let a = args[0];
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Log10 => a.log10(),
            Function::Log2 => a.log2(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
            Function::Sign => {
                if a == 0.0 {
                    0.0
                } else {
                    a.signum()
                }
            }
            Function::Floor => a.floor(),
            Function::Ceil => a.ceil(),
            Function::Min => a.min(args[1]),
            Function::Max => a.max(args[1]),
            Function::Pow => a.powf(args[1]),
            Function::Atan2 => a.atan2(args[1]),
        }
    }
}

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a variable store cell (by slot index).
    LoadSlot(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b). Fails when b is zero.
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops `arity` arguments, pushes the function result.
    Call(Function),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression produced a non-finite value ({0})")]
    NonFinite(f64),
    #[error("malformed bytecode: operand stack underflow")]
    StackUnderflow,
    #[error("variable(s) not bound to the store: {}", .0.join(", "))]
    Unbound(Vec<String>),
}

/// Stack-based virtual machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `slots`: the shared variable store cells (read-only).
/// - `stack`: a mutable buffer for intermediate computations.
pub struct VM;

impl VM {
    pub fn execute(
        bytecode: &Bytecode,
        slots: &[f64],
        stack: &mut Vec<f64>,
    ) -> Result<f64, EvalError> {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadSlot(idx) => {
                    let val = slots.get(idx).copied().ok_or(EvalError::StackUnderflow)?;
                    stack.push(val);
                }
                OpCode::Add => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let (a, b) = pop_pair(stack)?;
                    if b == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(a.powf(b));
                }
                OpCode::Neg => {
                    let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
                    stack.push(-a);
                }
                OpCode::Call(function) => {
                    let arity = function.arity();
                    if stack.len() < arity {
                        return Err(EvalError::StackUnderflow);
                    }
                    let args_start = stack.len() - arity;
                    let result = function.apply(&stack[args_start..]);
                    stack.truncate(args_start);
                    stack.push(result);
                }
            }
        }

        let result = stack.pop().ok_or(EvalError::StackUnderflow)?;
        if !result.is_finite() {
            return Err(EvalError::NonFinite(result));
        }
        Ok(result)
    }
}

fn pop_pair(stack: &mut Vec<f64>) -> Result<(f64, f64), EvalError> {
    let b = stack.pop().ok_or(EvalError::StackUnderflow)?;
    let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
    Ok((a, b))
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Neg(Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Names of all variables the expression reads.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                names.insert(name.clone());
            }
            Expr::Binary(left, _, right) => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
            Expr::Neg(operand) => operand.collect_variables(names),
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_variables(names);
                }
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message} at position {position}")]
pub struct ParseError {
    pub message: String,
    /// Byte offset into the parsed expression.
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    if parser.peek().is_none() {
        return Err(ParseError::new("empty expression", 0));
    }
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(ParseError::new(
            format!("unexpected {}", token.kind),
            token.pos,
        ));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Comma,
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Identifier(name) => write!(f, "identifier '{}'", name),
            TokenKind::Plus => f.write_str("'+'"),
            TokenKind::Minus => f.write_str("'-'"),
            TokenKind::Star => f.write_str("'*'"),
            TokenKind::Slash => f.write_str("'/'"),
            TokenKind::Caret => f.write_str("'^'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut end = pos;
            let mut seen_exponent = false;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_digit() || (d == '.' && !seen_exponent) {
                    end = i + 1;
                    chars.next();
                } else if (d == 'e' || d == 'E') && !seen_exponent {
                    // Only an exponent if digits follow, optionally signed.
                    let rest = &input[i + 1..];
                    let digits = rest.strip_prefix(|ch: char| ch == '+' || ch == '-').unwrap_or(rest);
                    if !digits.starts_with(|ch: char| ch.is_ascii_digit()) {
                        break;
                    }
                    seen_exponent = true;
                    chars.next();
                    end = i + 1;
                    if let Some(&(j, sign)) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            chars.next();
                            end = j + 1;
                        }
                    }
                } else {
                    break;
                }
            }
            let text = &input[pos..end];
            let value = text
                .parse::<f64>()
                .map_err(|_| ParseError::new(format!("invalid number '{}'", text), pos))?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                pos,
            });
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Identifier(ident),
                pos,
            });
        } else {
            let kind = match c {
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                '*' => TokenKind::Star,
                '/' => TokenKind::Slash,
                '^' => TokenKind::Caret,
                ',' => TokenKind::Comma,
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                _ => return Err(ParseError::new(format!("unexpected character '{}'", c), pos)),
            };
            tokens.push(Token { kind, pos });
            chars.next();
        }
    }
    Ok(tokens)
}

/// Deepest run of nested parentheses, signs, exponents or call arguments accepted.
const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|token| &token.kind)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        match self.consume() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(ParseError::new(
                format!("expected {}, found {}", kind, token.kind),
                token.pos,
            )),
            None => Err(ParseError::new(
                format!("expected {}, found end of expression", kind),
                self.end,
            )),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;

        while let Some(kind) = self.peek_kind() {
            let op = match kind {
                TokenKind::Plus => '+',
                TokenKind::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        while let Some(kind) = self.peek_kind() {
            let op = match kind {
                TokenKind::Star => '*',
                TokenKind::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Every recursive path of the grammar passes through here.
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.depth >= MAX_NESTING {
            let pos = self.peek().map_or(self.end, |token| token.pos);
            return Err(ParseError::new("expression nested too deeply", pos));
        }
        self.depth += 1;
        let result = self.parse_signed();
        self.depth -= 1;
        result
    }

    fn parse_signed(&mut self) -> Result<Expr, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::Minus) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            Some(TokenKind::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Right-associative, and binds tighter than unary minus: -x^2 == -(x^2).
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if let Some(TokenKind::Caret) = self.peek_kind() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.consume() else {
            return Err(ParseError::new("unexpected end of expression", self.end));
        };
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Identifier(name) => {
                if let Some(TokenKind::LParen) = self.peek_kind() {
                    self.consume(); // eat '('
                    self.parse_call(name, token.pos)
                } else {
                    Ok(match name.as_str() {
                        "_pi" => Expr::Number(std::f64::consts::PI),
                        "_e" => Expr::Number(std::f64::consts::E),
                        _ => Expr::Variable(name),
                    })
                }
            }
            TokenKind::LParen => {
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            other => Err(ParseError::new(format!("unexpected {}", other), token.pos)),
        }
    }

    fn parse_call(&mut self, name: String, name_pos: usize) -> Result<Expr, ParseError> {
        let function = Function::from_name(&name)
            .ok_or_else(|| ParseError::new(format!("unknown function '{}'", name), name_pos))?;

        let mut args = Vec::new();
        if let Some(TokenKind::RParen) = self.peek_kind() {
            self.consume();
        } else {
            loop {
                args.push(self.parse_expression()?);
                match self.peek_kind() {
                    Some(TokenKind::Comma) => {
                        self.consume();
                    }
                    _ => break,
                }
            }
            self.expect(TokenKind::RParen)?;
        }

        if args.len() != function.arity() {
            return Err(ParseError::new(
                format!(
                    "function '{}' expects {} argument(s), got {}",
                    name,
                    function.arity(),
                    args.len()
                ),
                name_pos,
            ));
        }
        Ok(Expr::Call(function, args))
    }
}

// --- Variable store ---

/// One numeric cell per distinct variable name referenced by any equation.
///
/// Compiled equations hold slot indices into `values`; every equation that reads the
/// same name reads the same cell.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    names: Vec<String>,
    index: HashMap<String, usize>,
    values: Vec<f64>,
}

impl VariableStore {
    pub fn from_names<I>(names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut store = Self::default();
        for name in names {
            if store.index.contains_key(&name) {
                continue;
            }
            store.index.insert(name.clone(), store.names.len());
            store.names.push(name);
            store.values.push(0.0);
        }
        store
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.slot(name).map(|slot| self.values[slot])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("no storage cell for: {}", .names.join(", "))]
pub struct BindError {
    pub names: Vec<String>,
}

/// Compiles an AST (`Expr`) into `Bytecode` against a variable store.
pub struct Compiler<'a> {
    store: &'a VariableStore,
}

impl<'a> Compiler<'a> {
    pub fn new(store: &'a VariableStore) -> Self {
        Self { store }
    }

    /// Fails with every name that has no cell in the store.
    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, BindError> {
        let mut ops = Vec::new();
        let mut unbound = BTreeSet::new();
        self.compile_recursive(expr, &mut ops, &mut unbound);
        if unbound.is_empty() {
            Ok(Bytecode { ops })
        } else {
            Err(BindError {
                names: unbound.into_iter().collect(),
            })
        }
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>, unbound: &mut BTreeSet<String>) {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => match self.store.slot(name) {
                Some(slot) => ops.push(OpCode::LoadSlot(slot)),
                None => {
                    unbound.insert(name.clone());
                }
            },
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops, unbound);
                self.compile_recursive(right, ops, unbound);
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    _ => OpCode::Pow,
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops, unbound);
                ops.push(OpCode::Neg);
            }
            Expr::Call(function, args) => {
                for arg in args {
                    self.compile_recursive(arg, ops, unbound);
                }
                ops.push(OpCode::Call(*function));
            }
        }
    }
}

// --- Equation forms ---

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EquationFormError {
    #[error("missing '='")]
    MissingEquals,
    #[error("left-hand side '{0}' is not of the form d(name)/dt")]
    NotDerivative(String),
}

/// Splits `"d(x)/dt = rhs"` on the first `=` and returns `(x, rhs)`, both trimmed.
pub fn split_derivative_equation(source: &str) -> Result<(&str, &str), EquationFormError> {
    let (lhs, rhs) = source
        .split_once('=')
        .ok_or(EquationFormError::MissingEquals)?;
    let lhs = lhs.trim();
    let target = lhs
        .strip_prefix("d(")
        .and_then(|rest| rest.strip_suffix(")/dt"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| EquationFormError::NotDerivative(lhs.to_string()))?;
    Ok((target, rhs.trim()))
}

/// A derivative equation that survived parsing.
#[derive(Debug, Clone)]
pub struct CompiledEquation {
    /// `d(target)/dt`.
    pub derivative_name: String,
    pub target: String,
    pub expression: String,
    pub free_variables: BTreeSet<String>,
    program: Result<Bytecode, BindError>,
    slots: Vec<usize>,
}

impl CompiledEquation {
    pub fn is_bound(&self) -> bool {
        self.program.is_ok()
    }
}

/// Why an equation was dropped or a variable will not evolve.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineDiagnostic {
    Malformed {
        equation: String,
        error: EquationFormError,
    },
    Syntax {
        equation: String,
        error: ParseError,
    },
    Binding {
        derivative: String,
        error: BindError,
    },
    DuplicateDerivative {
        derivative: String,
        equation: String,
    },
    UndeclaredTarget {
        derivative: String,
    },
    MissingDerivative {
        variable: String,
    },
}

impl fmt::Display for EngineDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineDiagnostic::Malformed { equation, error } => {
                write!(f, "skipped equation '{}': {}", equation, error)
            }
            EngineDiagnostic::Syntax { equation, error } => {
                write!(f, "skipped equation '{}': {}", equation, error)
            }
            EngineDiagnostic::Binding { derivative, error } => {
                write!(f, "{} cannot be evaluated: {}", derivative, error)
            }
            EngineDiagnostic::DuplicateDerivative {
                derivative,
                equation,
            } => write!(
                f,
                "skipped equation '{}': {} is already defined",
                equation, derivative
            ),
            EngineDiagnostic::UndeclaredTarget { derivative } => write!(
                f,
                "{} does not belong to a declared dynamic variable",
                derivative
            ),
            EngineDiagnostic::MissingDerivative { variable } => write!(
                f,
                "dynamic variable '{}' has no derivative equation and will not evolve",
                variable
            ),
        }
    }
}

// --- Evaluation results ---

#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Ok(f64),
    /// Evaluated, but at least one input kept its previous cell value.
    StaleFallback(f64),
    Failed(EvalError),
}

impl EvalOutcome {
    /// Value applied by the stepper. Failed evaluations contribute 0.0.
    pub fn value(&self) -> f64 {
        match self {
            EvalOutcome::Ok(v) | EvalOutcome::StaleFallback(v) => *v,
            EvalOutcome::Failed(_) => 0.0,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, EvalOutcome::Ok(_))
    }
}

/// Derivative values for one state snapshot, keyed by `d(name)/dt`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Derivatives {
    outcomes: BTreeMap<String, EvalOutcome>,
    stale_variables: Vec<String>,
}

impl Derivatives {
    pub fn get(&self, derivative: &str) -> Option<&EvalOutcome> {
        self.outcomes.get(derivative)
    }

    pub fn value(&self, derivative: &str) -> Option<f64> {
        self.get(derivative).map(EvalOutcome::value)
    }

    pub fn to_values(&self) -> BTreeMap<String, f64> {
        self.outcomes
            .iter()
            .map(|(name, outcome)| (name.clone(), outcome.value()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EvalOutcome)> {
        self.outcomes.iter()
    }

    /// Store cells that were neither in the state nor declared Constants.
    pub fn stale_variables(&self) -> &[String] {
        &self.stale_variables
    }

    pub fn is_degraded(&self) -> bool {
        self.outcomes.values().any(|outcome| !outcome.is_ok())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// --- EquationEngine ---

/// Compiled derivative equations of one model, bound to a single variable store.
#[derive(Debug, Clone)]
pub struct EquationEngine {
    equations: Vec<CompiledEquation>,
    store: VariableStore,
    constants: HashMap<String, f64>,
    diagnostics: Vec<EngineDiagnostic>,
    stack: Vec<f64>,
}

impl EquationEngine {
    /// Compiles every derivative equation in `model`.
    ///
    /// Never fails: malformed or unparsable equations are dropped and recorded in
    /// [`EquationEngine::diagnostics`], the rest are compiled.
    pub fn new(model: &Model) -> Self {
        let mut diagnostics = Vec::new();
        let mut parsed: Vec<(String, String, String, Expr)> = Vec::new();

        for source in &model.equations {
            let (target, rhs) = match split_derivative_equation(source) {
                Ok(parts) => parts,
                Err(error) => {
                    warn!(equation = %source, %error, "skipping equation");
                    diagnostics.push(EngineDiagnostic::Malformed {
                        equation: source.clone(),
                        error,
                    });
                    continue;
                }
            };
            let derivative = derivative_name(target);
            if parsed.iter().any(|(name, ..)| *name == derivative) {
                warn!(equation = %source, %derivative, "skipping duplicate derivative equation");
                diagnostics.push(EngineDiagnostic::DuplicateDerivative {
                    derivative,
                    equation: source.clone(),
                });
                continue;
            }
            match parse(rhs) {
                Ok(expr) => parsed.push((derivative, target.to_string(), rhs.to_string(), expr)),
                Err(error) => {
                    warn!(
                        equation = %source,
                        position = error.position,
                        "failed to parse right-hand side: {}",
                        error.message
                    );
                    diagnostics.push(EngineDiagnostic::Syntax {
                        equation: source.clone(),
                        error,
                    });
                }
            }
        }

        let free_sets: Vec<BTreeSet<String>> =
            parsed.iter().map(|(.., expr)| expr.free_variables()).collect();
        let all_names: BTreeSet<String> = free_sets.iter().flatten().cloned().collect();
        let store = VariableStore::from_names(all_names);
        let compiler = Compiler::new(&store);

        let mut equations = Vec::with_capacity(parsed.len());
        for ((derivative_name, target, expression, expr), free_variables) in
            parsed.into_iter().zip(free_sets)
        {
            let program = compiler.compile(&expr);
            if let Err(error) = &program {
                warn!(derivative = %derivative_name, %error, "failed to bind equation variables");
                diagnostics.push(EngineDiagnostic::Binding {
                    derivative: derivative_name.clone(),
                    error: error.clone(),
                });
            }
            let slots = free_variables
                .iter()
                .filter_map(|name| store.slot(name))
                .collect();
            equations.push(CompiledEquation {
                derivative_name,
                target,
                expression,
                free_variables,
                program,
                slots,
            });
        }

        let dynamic_names: BTreeSet<&str> = model
            .variables_of(VariableKind::Dynamic)
            .map(|var| var.name.as_str())
            .collect();
        for equation in &equations {
            if !dynamic_names.contains(equation.target.as_str()) {
                warn!(derivative = %equation.derivative_name, "equation target is not a declared dynamic variable");
                diagnostics.push(EngineDiagnostic::UndeclaredTarget {
                    derivative: equation.derivative_name.clone(),
                });
            }
        }
        for name in dynamic_names {
            let compiled = equations
                .iter()
                .any(|equation| equation.target == name && equation.is_bound());
            if !compiled {
                warn!(variable = %name, "dynamic variable has no usable derivative equation");
                diagnostics.push(EngineDiagnostic::MissingDerivative {
                    variable: name.to_string(),
                });
            }
        }

        let constants = model
            .variables_of(VariableKind::Constant)
            .map(|var| (var.name.clone(), var.initial.number_or_zero()))
            .collect();

        debug!(
            equations = equations.len(),
            cells = store.len(),
            "equation engine compiled"
        );

        Self {
            equations,
            store,
            constants,
            diagnostics,
            stack: Vec::with_capacity(64),
        }
    }

    pub fn equations(&self) -> &[CompiledEquation] {
        &self.equations
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn diagnostics(&self) -> &[EngineDiagnostic] {
        &self.diagnostics
    }

    /// Every variable name any compiled equation reads.
    pub fn free_variables(&self) -> &[String] {
        self.store.names()
    }

    /// Evaluates every compiled equation against `state`.
    ///
    /// All store cells are refreshed before any expression runs. A cell whose name is
    /// neither in `state` nor a declared Constant keeps its previous value; equations
    /// reading it report [`EvalOutcome::StaleFallback`]. A failing equation reports
    /// [`EvalOutcome::Failed`] without affecting the others.
    pub fn evaluate_derivatives(&mut self, state: &SimulationState) -> Derivatives {
        let mut stale = vec![false; self.store.len()];
        let mut stale_variables = Vec::new();

        for (slot, name) in self.store.names.iter().enumerate() {
            if let Some(value) = state.get(name) {
                self.store.values[slot] = *value;
            } else if let Some(value) = self.constants.get(name) {
                self.store.values[slot] = *value;
            } else {
                warn!(
                    variable = %name,
                    value = self.store.values[slot],
                    "variable missing from state and constants; using previous value"
                );
                stale[slot] = true;
                stale_variables.push(name.clone());
            }
        }

        let mut outcomes = BTreeMap::new();
        for equation in &self.equations {
            let outcome = match &equation.program {
                Ok(bytecode) => match VM::execute(bytecode, &self.store.values, &mut self.stack) {
                    Ok(value) if equation.slots.iter().any(|slot| stale[*slot]) => {
                        EvalOutcome::StaleFallback(value)
                    }
                    Ok(value) => EvalOutcome::Ok(value),
                    Err(error) => {
                        warn!(
                            derivative = %equation.derivative_name,
                            expression = %equation.expression,
                            %error,
                            "evaluation failed; using 0.0"
                        );
                        EvalOutcome::Failed(error)
                    }
                },
                Err(bind) => EvalOutcome::Failed(EvalError::Unbound(bind.names.clone())),
            };
            outcomes.insert(equation.derivative_name.clone(), outcome);
        }

        Derivatives {
            outcomes,
            stale_variables,
        }
    }
}

impl DerivativeSource for EquationEngine {
    fn derivatives(&mut self, state: &SimulationState) -> Derivatives {
        self.evaluate_derivatives(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InitialValue, Variable};

    fn eval(input: &str, vars: &[(&str, f64)]) -> Result<f64, EvalError> {
        let expr = parse(input).expect("expression should parse");
        let store = VariableStore::from_names(vars.iter().map(|(name, _)| name.to_string()));
        let bytecode = Compiler::new(&store).compile(&expr).expect("should bind");
        let slots: Vec<f64> = vars.iter().map(|(_, v)| *v).collect();
        VM::execute(&bytecode, &slots, &mut Vec::new())
    }

    fn oscillator() -> Model {
        Model::new("oscillator")
            .with_variable(Variable::dynamic("x", 0.5))
            .with_variable(Variable::dynamic("v", 0.0))
            .with_variable(Variable::constant("m", 2.0))
            .with_variable(Variable::constant("k", 10.0))
            .with_variable(Variable::input("F_ext"))
            .with_equation("d(v)/dt = (-k*x+F_ext)/m")
            .with_equation("d(x)/dt = v")
    }

    fn state(entries: &[(&str, f64)]) -> SimulationState {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[]), Ok(7.0));
        assert_eq!(eval("(1 + 2) * 3", &[]), Ok(9.0));
        assert_eq!(eval("8 / 4 / 2", &[]), Ok(1.0));
        assert_eq!(eval("10 - 4 - 3", &[]), Ok(3.0));
        assert_eq!(eval("2 ^ 3 ^ 2", &[]), Ok(512.0));
        assert_eq!(eval("-2 ^ 2", &[]), Ok(-4.0));
        assert_eq!(eval("2 ^ -1", &[]), Ok(0.5));
        assert_eq!(eval("--3", &[]), Ok(3.0));
        assert_eq!(eval("+3 - -1", &[]), Ok(4.0));
    }

    #[test]
    fn numbers_with_exponents() {
        let milli = eval("1e-3 * 1000", &[]).expect("should evaluate");
        assert!((milli - 1.0).abs() < 1e-12, "got {milli}");
        assert_eq!(eval("2.5E+2", &[]), Ok(250.0));
        assert_eq!(eval(".5 + 0.25", &[]), Ok(0.75));
    }

    #[test]
    fn variables_functions_and_constants() {
        let result = eval("max(a, b) + min(a, b) * sqrt(c)", &[("a", 1.0), ("b", 3.0), ("c", 4.0)])
            .expect("should evaluate");
        assert!((result - 5.0).abs() < 1e-12, "got {result}");

        let result = eval("sin(_pi / 2) + ln(_e)", &[]).expect("should evaluate");
        assert!((result - 2.0).abs() < 1e-12, "got {result}");

        assert_eq!(eval("abs(x) + sign(x)", &[("x", -2.0)]), Ok(1.0));
        assert_eq!(eval("pow(2, 10)", &[]), Ok(1024.0));
    }

    #[test]
    fn free_variables_exclude_builtins() {
        let expr = parse("(-k*x + F_ext)/m + sin(_pi*t) + k").expect("should parse");
        let names: Vec<String> = expr.free_variables().into_iter().collect();
        assert_eq!(names, vec!["F_ext", "k", "m", "t", "x"]);
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = parse("x + * 2").expect_err("should fail");
        assert_eq!(err.position, 4, "unexpected error: {err}");

        let err = parse("(x + 1").expect_err("should fail");
        assert_eq!(err.position, 6, "unexpected error: {err}");
        assert!(err.message.contains("')'"), "unexpected error: {err}");

        let err = parse("x $ 2").expect_err("should fail");
        assert_eq!(err.position, 2);

        let err = parse("x y").expect_err("trailing token should fail");
        assert_eq!(err.position, 2);

        assert!(parse("   ").is_err());
    }

    #[test]
    fn parse_rejects_unknown_functions_and_bad_arity() {
        let err = parse("foo(x)").expect_err("should fail");
        assert!(err.message.contains("unknown function"), "unexpected error: {err}");

        let err = parse("min(x)").expect_err("should fail");
        assert!(err.message.contains("expects 2"), "unexpected error: {err}");
    }

    #[test]
    fn deep_nesting_is_a_parse_error() {
        let err = parse(&"(".repeat(10_000)).expect_err("should fail");
        assert!(err.message.contains("nested too deeply"), "unexpected error: {err}");
        assert_eq!(err.position, MAX_NESTING);

        let signs = format!("{}x", "-".repeat(200_000));
        assert!(parse(&signs).is_err());

        let exponents = vec!["x"; 5_000].join("^");
        assert!(parse(&exponents).is_err());

        let nested = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse(&nested), Ok(Expr::Variable("x".to_string())));
    }

    #[test]
    fn runtime_faults_are_errors() {
        assert_eq!(eval("1 / x", &[("x", 0.0)]), Err(EvalError::DivisionByZero));
        assert!(matches!(eval("sqrt(-1)", &[]), Err(EvalError::NonFinite(_))));
        assert!(matches!(eval("ln(0)", &[]), Err(EvalError::NonFinite(_))));
    }

    #[test]
    fn compiler_reports_unbound_names() {
        let expr = parse("a + b + c").expect("should parse");
        let store = VariableStore::from_names(vec!["a".to_string()]);
        let err = Compiler::new(&store).compile(&expr).expect_err("should fail");
        assert_eq!(err.names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn split_equation_forms() {
        assert_eq!(split_derivative_equation(" d(x)/dt =  v "), Ok(("x", "v")));
        assert_eq!(split_derivative_equation("d( y )/dt = a = b"), Ok(("y", "a = b")));
        assert_eq!(
            split_derivative_equation("d(x)/dt v"),
            Err(EquationFormError::MissingEquals)
        );
        assert_eq!(
            split_derivative_equation("y = 2*x"),
            Err(EquationFormError::NotDerivative("y".to_string()))
        );
        assert!(split_derivative_equation("d()/dt = 1").is_err());
    }

    #[test]
    fn store_has_one_cell_per_name() {
        let engine = EquationEngine::new(&oscillator());
        let mut names = engine.store().names().to_vec();
        names.sort();
        assert_eq!(names, vec!["F_ext", "k", "m", "v", "x"]);
        assert_eq!(engine.equations().len(), 2);
        assert!(engine.diagnostics().is_empty(), "{:?}", engine.diagnostics());
    }

    #[test]
    fn evaluates_oscillator_derivatives() {
        let mut engine = EquationEngine::new(&oscillator());
        let snapshot = state(&[("x", 0.5), ("v", 0.0), ("m", 2.0), ("k", 10.0), ("F_ext", 0.0)]);
        let derivatives = engine.evaluate_derivatives(&snapshot);

        assert_eq!(derivatives.get("d(v)/dt"), Some(&EvalOutcome::Ok(-2.5)));
        assert_eq!(derivatives.get("d(x)/dt"), Some(&EvalOutcome::Ok(0.0)));
        assert!(!derivatives.is_degraded());
        assert!(derivatives.stale_variables().is_empty());
    }

    #[test]
    fn missing_state_value_falls_back_to_constant() {
        let mut engine = EquationEngine::new(&oscillator());
        let snapshot = state(&[("x", 0.5), ("v", 1.0), ("F_ext", 1.0)]);
        let derivatives = engine.evaluate_derivatives(&snapshot);

        assert_eq!(derivatives.get("d(v)/dt"), Some(&EvalOutcome::Ok(-2.0)));
        assert_eq!(derivatives.value("d(x)/dt"), Some(1.0));
    }

    #[test]
    fn placeholder_constant_falls_back_to_zero() {
        let mut model = Model::new("placeholder")
            .with_variable(Variable::dynamic("x", 1.0))
            .with_variable(Variable::constant("g", 9.81))
            .with_equation("d(x)/dt = g + 1");
        model.variables[1].initial = InitialValue::Placeholder("gravity".to_string());
        let mut engine = EquationEngine::new(&model);

        let derivatives = engine.evaluate_derivatives(&state(&[("x", 1.0)]));

        assert_eq!(derivatives.get("d(x)/dt"), Some(&EvalOutcome::Ok(1.0)));
        assert!(derivatives.stale_variables().is_empty());
    }

    #[test]
    fn deeply_nested_equation_is_skipped_alone() {
        let deep = format!("d(x)/dt = {}1{}", "(".repeat(50_000), ")".repeat(50_000));
        let model = Model::new("deep")
            .with_variable(Variable::dynamic("x", 0.0))
            .with_variable(Variable::dynamic("y", 0.0))
            .with_equation(&deep)
            .with_equation("d(y)/dt = 2");
        let mut engine = EquationEngine::new(&model);

        assert!(engine
            .diagnostics()
            .iter()
            .any(|d| matches!(d, EngineDiagnostic::Syntax { .. })));
        let derivatives = engine.evaluate_derivatives(&SimulationState::new());
        assert_eq!(derivatives.value("d(y)/dt"), Some(2.0));
        assert_eq!(derivatives.get("d(x)/dt"), None);
    }

    #[test]
    fn missing_non_constant_keeps_previous_cell_value() {
        let mut engine = EquationEngine::new(&oscillator());
        let full = state(&[("x", 0.5), ("v", 0.0), ("F_ext", 3.0)]);
        engine.evaluate_derivatives(&full);

        let partial = state(&[("x", 0.5), ("v", 0.0)]);
        let derivatives = engine.evaluate_derivatives(&partial);

        assert_eq!(derivatives.stale_variables(), ["F_ext".to_string()]);
        assert_eq!(
            derivatives.get("d(v)/dt"),
            Some(&EvalOutcome::StaleFallback(-1.0))
        );
        assert_eq!(derivatives.get("d(x)/dt"), Some(&EvalOutcome::Ok(0.0)));
        assert!(derivatives.is_degraded());
    }

    #[test]
    fn evaluation_does_not_touch_caller_state() {
        let mut engine = EquationEngine::new(&oscillator());
        let snapshot = state(&[("x", 0.5), ("v", 0.25)]);
        let before = snapshot.clone();
        engine.evaluate_derivatives(&snapshot);
        assert_eq!(snapshot, before);
    }

    #[test]
    fn broken_equations_do_not_stop_the_others() {
        let model = Model::new("partial")
            .with_variable(Variable::dynamic("a", 1.0))
            .with_variable(Variable::dynamic("b", 1.0))
            .with_variable(Variable::dynamic("c", 1.0))
            .with_variable(Variable::dynamic("d", 1.0))
            .with_equation("d(a)/dt 2*a")
            .with_equation("d(b)/dt = 2*b +")
            .with_equation("y = 3")
            .with_equation("d(c)/dt = c / (d - 1)")
            .with_equation("d(d)/dt = -d");
        let mut engine = EquationEngine::new(&model);

        assert_eq!(engine.equations().len(), 2);
        let derivatives = engine.evaluate_derivatives(&state(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]));
        assert_eq!(
            derivatives.get("d(c)/dt"),
            Some(&EvalOutcome::Failed(EvalError::DivisionByZero))
        );
        assert_eq!(derivatives.value("d(c)/dt"), Some(0.0));
        assert_eq!(derivatives.get("d(d)/dt"), Some(&EvalOutcome::Ok(-1.0)));
        assert_eq!(derivatives.get("d(a)/dt"), None);
        assert_eq!(derivatives.get("d(b)/dt"), None);

        let diagnostics = engine.diagnostics();
        assert!(diagnostics.iter().any(|d| matches!(
            d,
            EngineDiagnostic::Malformed { error: EquationFormError::MissingEquals, .. }
        )));
        assert!(diagnostics.iter().any(|d| matches!(
            d,
            EngineDiagnostic::Malformed { error: EquationFormError::NotDerivative(_), .. }
        )));
        assert!(diagnostics.iter().any(|d| matches!(d, EngineDiagnostic::Syntax { .. })));
        assert!(diagnostics.contains(&EngineDiagnostic::MissingDerivative {
            variable: "a".to_string()
        }));
        assert!(diagnostics.contains(&EngineDiagnostic::MissingDerivative {
            variable: "b".to_string()
        }));
    }

    #[test]
    fn duplicate_and_undeclared_derivatives_are_diagnosed() {
        let model = Model::new("dups")
            .with_variable(Variable::dynamic("x", 1.0))
            .with_equation("d(x)/dt = 1")
            .with_equation("d(x)/dt = 2")
            .with_equation("d(z)/dt = x");
        let mut engine = EquationEngine::new(&model);

        let derivatives = engine.evaluate_derivatives(&state(&[("x", 1.0)]));
        assert_eq!(derivatives.value("d(x)/dt"), Some(1.0));
        assert_eq!(derivatives.value("d(z)/dt"), Some(1.0));
        assert!(engine.diagnostics().iter().any(|d| matches!(
            d,
            EngineDiagnostic::DuplicateDerivative { .. }
        )));
        assert!(engine.diagnostics().contains(&EngineDiagnostic::UndeclaredTarget {
            derivative: "d(z)/dt".to_string()
        }));
    }

    #[test]
    fn compiling_twice_gives_identical_results() {
        let model = oscillator();
        let mut first = EquationEngine::new(&model);
        let mut second = EquationEngine::new(&model);
        let snapshot = state(&[("x", -0.3), ("v", 1.7), ("F_ext", 0.4)]);
        assert_eq!(
            first.evaluate_derivatives(&snapshot),
            second.evaluate_derivatives(&snapshot)
        );
    }
}
