//! The universal value type: immutable vectors of doubles or symbols.
//!
//! Every expression evaluates to a `Vector`. The empty vector — **null** —
//! is the identity of composition and the result of any operation that does
//! not make sense (arithmetic on strings, lookups that miss, calls of
//! non-functions). Arithmetic is elementwise with max-length broadcast: the
//! shorter operand cycles. A vector never mixes element kinds; compositions
//! that would mix numbers and strings degrade to strings.
//!
//! Beyond the two plain kinds, a vector can carry scene-graph nodes, a
//! builtin function, a user closure, or an unbounded pseudo-random source.
//! These all behave as null under arithmetic.

use std::{cmp::Ordering, fmt, sync::Arc};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    functions::BuiltinFunction,
    hashing::{StableHasher, mix},
    nodes::Node,
    symbols::Symbol,
    tree::{CompareOperator, FunctionDef, MathOperator, UnaryOperator},
};

/// An immutable value: a finite sequence of doubles or interned symbols, a
/// sequence of scene-graph nodes, a callable, or a pseudo-random source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vector {
    Numbers(Vec<f64>),
    Symbols(Vec<Symbol>),
    Nodes(Vec<Arc<Node>>),
    Builtin(BuiltinFunction),
    Closure(Arc<Closure>),
    Random(RandomSource),
}

/// A user function bound to the values it captured at definition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub function: Arc<FunctionDef>,
    pub captured: Vec<(Symbol, Vector)>,
}

/// Distribution of a pseudo-random source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    Uniform,
    Normal,
    Beta,
}

/// An unbounded deterministic stream of doubles, indexable by any integer.
///
/// Two sources with the same distribution and the same (floored) seed vector
/// produce identical streams; overlapping slices agree element-for-element.
/// A source hashes like its seed and behaves as null under arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomSource {
    kind: Distribution,
    seed: u64,
}

impl RandomSource {
    #[must_use]
    pub fn new(kind: Distribution, seed_vector: &Vector) -> Self {
        Self {
            kind,
            seed: seed_vector.stable_hash(true),
        }
    }

    /// The value at `index`; negative indices are valid.
    #[must_use]
    pub fn value(&self, index: i64) -> f64 {
        let salt = match self.kind {
            Distribution::Uniform => 0x75,
            Distribution::Normal => 0x6e,
            Distribution::Beta => 0x62,
        };
        let lane = mix(self.seed ^ salt, u64::from_ne_bytes(index.to_ne_bytes()));
        let mut rng = ChaCha8Rng::seed_from_u64(lane);
        match self.kind {
            Distribution::Uniform => rng.r#gen::<f64>(),
            Distribution::Normal => {
                // Box-Muller; the log argument is kept away from zero.
                let u1: f64 = 1.0 - rng.r#gen::<f64>();
                let u2: f64 = rng.r#gen();
                (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
            }
            Distribution::Beta => {
                // Beta(2, 2) is the median of three independent uniforms.
                let mut samples = [rng.r#gen::<f64>(), rng.r#gen::<f64>(), rng.r#gen::<f64>()];
                samples.sort_by(f64::total_cmp);
                samples[1]
            }
        }
    }

    #[must_use]
    pub fn seed_hash(&self) -> u64 {
        self.seed
    }
}

/// The canonical true value.
#[must_use]
pub fn true_vector() -> Vector {
    Vector::Numbers(vec![1.0])
}

/// The canonical false value.
#[must_use]
pub fn false_vector() -> Vector {
    Vector::Numbers(vec![0.0])
}

impl Vector {
    /// The null vector: zero length, identity of composition.
    #[must_use]
    pub const fn null() -> Self {
        Self::Numbers(Vec::new())
    }

    #[must_use]
    pub fn symbol(name: &str) -> Self {
        Self::Symbols(vec![Symbol::new(name)])
    }

    #[must_use]
    pub fn boolean(value: bool) -> Self {
        if value { true_vector() } else { false_vector() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Numbers(xs) => xs.len(),
            Self::Symbols(xs) => xs.len(),
            Self::Nodes(xs) => xs.len(),
            Self::Builtin(_) | Self::Closure(_) => 1,
            Self::Random(_) => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for the zero-length plain kinds. Callables are not null; a
    /// random source has no length but is a real value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Numbers(xs) => xs.is_empty(),
            Self::Symbols(xs) => xs.is_empty(),
            Self::Nodes(xs) => xs.is_empty(),
            Self::Builtin(_) | Self::Closure(_) | Self::Random(_) => false,
        }
    }

    /// Truthiness: any non-zero number, any non-empty symbol, any node.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Numbers(xs) => xs.iter().any(|x| *x != 0.0),
            Self::Symbols(xs) => xs.iter().any(|s| !s.as_str().is_empty()),
            Self::Nodes(xs) => !xs.is_empty(),
            Self::Builtin(_) | Self::Closure(_) => true,
            Self::Random(_) => false,
        }
    }

    #[must_use]
    pub fn numbers(&self) -> Option<&[f64]> {
        match self {
            Self::Numbers(xs) => Some(xs),
            _ => None,
        }
    }

    #[must_use]
    pub fn nodes(&self) -> Option<&[Arc<Node>]> {
        match self {
            Self::Nodes(xs) => Some(xs),
            _ => None,
        }
    }

    /// The value as a single number, if it is exactly one number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self.numbers() {
            Some([x]) => Some(*x),
            _ => None,
        }
    }

    /// The value rendered as one string: a single symbol resolves, a single
    /// number formats. Used for attribute and path coercion.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Symbols(xs) if xs.len() == 1 => Some(xs[0].as_str().to_owned()),
            Self::Numbers(xs) if xs.len() == 1 => Some(format_number(xs[0])),
            _ => None,
        }
    }

    /// Element `index` as a one-element vector, or null when out of range.
    #[must_use]
    pub fn item(&self, index: usize) -> Self {
        match self {
            Self::Numbers(xs) => xs.get(index).map_or_else(Self::null, |x| Self::Numbers(vec![*x])),
            Self::Symbols(xs) => xs.get(index).map_or_else(Self::null, |s| Self::Symbols(vec![*s])),
            Self::Nodes(xs) => xs
                .get(index)
                .map_or_else(Self::null, |n| Self::Nodes(vec![n.clone()])),
            Self::Random(source) => {
                let index = i64::try_from(index).unwrap_or(i64::MAX);
                Self::Numbers(vec![source.value(index)])
            }
            Self::Builtin(_) | Self::Closure(_) => {
                if index == 0 { self.clone() } else { Self::null() }
            }
        }
    }

    /// Element `index` with wrap-around, for positional unpacking. Null when
    /// the vector is empty.
    #[must_use]
    pub fn item_wrapped(&self, index: usize) -> Self {
        let len = self.len();
        if len == 0 {
            match self {
                Self::Random(_) => self.item(index),
                _ => Self::null(),
            }
        } else {
            self.item(index % len)
        }
    }

    /// Gathers the elements selected by `indices` (floored). Out-of-range
    /// indices select nothing; a random source yields a value for any index.
    #[must_use]
    pub fn slice(&self, indices: &Self) -> Self {
        let Some(picks) = indices.numbers() else {
            return Self::null();
        };
        if let Self::Random(source) = self {
            let values = picks.iter().map(|i| source.value(i.floor() as i64)).collect();
            return Self::Numbers(values);
        }
        let parts: Vec<Self> = picks
            .iter()
            .filter_map(|i| {
                let i = i.floor();
                if i >= 0.0 && (i as usize) < self.len() {
                    Some(self.item(i as usize))
                } else {
                    None
                }
            })
            .collect();
        Self::compose(parts)
    }

    /// Materializes `start..stop` by `step`. A zero or non-finite step
    /// yields null.
    #[must_use]
    pub fn range(start: f64, stop: f64, step: f64) -> Self {
        if step == 0.0 || !step.is_finite() || !start.is_finite() || !stop.is_finite() {
            return Self::null();
        }
        let mut values = Vec::new();
        let mut i = 0u64;
        loop {
            let x = step.mul_add(i as f64, start);
            if (step > 0.0 && x >= stop) || (step < 0.0 && x <= stop) {
                break;
            }
            values.push(x);
            i += 1;
        }
        Self::Numbers(values)
    }

    /// Concatenates parts into one vector. Null parts vanish; a single part
    /// passes through; mixed numeric/symbol parts degrade to symbols; in a
    /// composition containing nodes only the nodes survive.
    #[must_use]
    pub fn compose(parts: Vec<Self>) -> Self {
        let mut parts: Vec<Self> = parts.into_iter().filter(|part| !part.is_null()).collect();
        match parts.len() {
            0 => return Self::null(),
            1 => return parts.pop().expect("one part"),
            _ => {}
        }
        if parts.iter().any(|part| matches!(part, Self::Nodes(_))) {
            let mut nodes = Vec::new();
            for part in parts {
                if let Self::Nodes(ns) = part {
                    nodes.extend(ns);
                }
            }
            return Self::Nodes(nodes);
        }
        if parts.iter().all(|part| matches!(part, Self::Numbers(_))) {
            let mut numbers = Vec::new();
            for part in parts {
                if let Self::Numbers(xs) = part {
                    numbers.extend(xs);
                }
            }
            return Self::Numbers(numbers);
        }
        let mut symbols = Vec::new();
        for part in parts {
            match part {
                Self::Symbols(xs) => symbols.extend(xs),
                Self::Numbers(xs) => symbols.extend(xs.iter().map(|x| Symbol::new(&format_number(*x)))),
                _ => {}
            }
        }
        Self::Symbols(symbols)
    }

    pub(crate) fn map_numbers(&self, f: impl Fn(f64) -> f64) -> Self {
        match self.numbers() {
            Some(xs) if !xs.is_empty() => Self::Numbers(xs.iter().map(|x| f(*x)).collect()),
            _ => Self::null(),
        }
    }

    fn zip_numbers(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        match (self.numbers(), other.numbers()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
                let n = a.len().max(b.len());
                Self::Numbers((0..n).map(|i| f(a[i % a.len()], b[i % b.len()])).collect())
            }
            _ => Self::null(),
        }
    }

    #[must_use]
    pub fn pos(&self) -> Self {
        self.map_numbers(|x| x)
    }

    #[must_use]
    pub fn neg(&self) -> Self {
        self.map_numbers(|x| -x)
    }

    #[must_use]
    pub fn ceil(&self) -> Self {
        self.map_numbers(f64::ceil)
    }

    #[must_use]
    pub fn floor(&self) -> Self {
        self.map_numbers(f64::floor)
    }

    /// Fractional part, `x - floor(x)`, always in `[0, 1)`.
    #[must_use]
    pub fn fract(&self) -> Self {
        self.map_numbers(|x| x - x.floor())
    }

    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        self.zip_numbers(other, |a, b| a + b)
    }

    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        self.zip_numbers(other, |a, b| a - b)
    }

    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        self.zip_numbers(other, |a, b| a * b)
    }

    #[must_use]
    pub fn div(&self, other: &Self) -> Self {
        self.zip_numbers(other, |a, b| a / b)
    }

    /// Floored division, matching the floored modulo below.
    #[must_use]
    pub fn floordiv(&self, other: &Self) -> Self {
        self.zip_numbers(other, |a, b| (a / b).floor())
    }

    /// Floored modulo: the result takes the sign of the divisor.
    #[must_use]
    pub fn modulo(&self, other: &Self) -> Self {
        self.zip_numbers(other, |a, b| a - b * (a / b).floor())
    }

    #[must_use]
    pub fn pow(&self, other: &Self) -> Self {
        self.zip_numbers(other, f64::powf)
    }

    /// Elementwise ordering where both operands are comparable: numbers
    /// compare numerically, symbols lexically; a shared prefix defers to
    /// length. `None` for anything else.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Numbers(a), Self::Numbers(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.partial_cmp(y) {
                        Some(Ordering::Equal) => {}
                        Some(order) => return Some(order),
                        None => return None,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Self::Symbols(a), Self::Symbols(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.as_str().cmp(y.as_str()) {
                        Ordering::Equal => {}
                        order => return Some(order),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// Stable 64-bit hash, identical across processes. With `floor_floats`
    /// every number is floored first (random-source seeding). A random
    /// source hashes as its seed vector did.
    #[must_use]
    pub fn stable_hash(&self, floor_floats: bool) -> u64 {
        match self {
            Self::Numbers(xs) => {
                let mut hasher = StableHasher::new();
                for x in xs {
                    if floor_floats {
                        hasher.write_f64(x.floor());
                    } else {
                        hasher.write_f64(*x);
                    }
                }
                hasher.finish()
            }
            Self::Symbols(xs) => {
                let mut hasher = StableHasher::new();
                for s in xs {
                    hasher.write_str(s.as_str());
                }
                hasher.finish()
            }
            Self::Nodes(xs) => {
                let mut hasher = StableHasher::new();
                for n in xs {
                    hasher.write_u64(n.stable_hash());
                }
                hasher.finish()
            }
            Self::Builtin(f) => {
                let mut hasher = StableHasher::new();
                hasher.write_str(f.name());
                hasher.finish()
            }
            Self::Closure(c) => {
                let mut hasher = StableHasher::new();
                hasher.write_str(c.function.name.as_str());
                hasher.finish()
            }
            Self::Random(source) => source.seed_hash(),
        }
    }

    /// Parses a definition value: `;`-separated parts, each a number, an
    /// `MM:SS[.ms]` / `HH:MM:SS[.ms]` timecode (seconds), or a symbol.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let parts: Vec<Self> = text
            .split(';')
            .map(|part| {
                let part = part.trim();
                if let Ok(x) = part.parse::<f64>() {
                    Self::Numbers(vec![x])
                } else if let Some(seconds) = parse_timecode(part) {
                    Self::Numbers(vec![seconds])
                } else if part.is_empty() {
                    Self::null()
                } else {
                    Self::symbol(part)
                }
            })
            .collect();
        Self::compose(parts)
    }
}

/// Applies a unary operator to a value. `Not` goes through truthiness; the
/// numeric operators yield null on non-numeric operands.
#[must_use]
pub fn apply_unary(op: UnaryOperator, value: &Vector) -> Vector {
    match op {
        UnaryOperator::Positive => value.pos(),
        UnaryOperator::Negative => value.neg(),
        UnaryOperator::Ceil => value.ceil(),
        UnaryOperator::Floor => value.floor(),
        UnaryOperator::Fract => value.fract(),
        UnaryOperator::Not => Vector::boolean(!value.truthy()),
    }
}

/// Applies a binary arithmetic operator; null propagates.
#[must_use]
pub fn apply_math(op: MathOperator, a: &Vector, b: &Vector) -> Vector {
    match op {
        MathOperator::Add => a.add(b),
        MathOperator::Subtract => a.sub(b),
        MathOperator::Multiply => a.mul(b),
        MathOperator::Divide => a.div(b),
        MathOperator::FloorDivide => a.floordiv(b),
        MathOperator::Modulo => a.modulo(b),
        MathOperator::Power => a.pow(b),
    }
}

/// Applies a comparison. Equality is deep and total; the ordering operators
/// yield null when the operands do not compare.
#[must_use]
pub fn apply_compare(op: CompareOperator, a: &Vector, b: &Vector) -> Vector {
    match op {
        CompareOperator::EqualTo => Vector::boolean(a == b),
        CompareOperator::NotEqualTo => Vector::boolean(a != b),
        _ => match a.compare(b) {
            Some(order) => Vector::boolean(match op {
                CompareOperator::LessThan => order == Ordering::Less,
                CompareOperator::GreaterThan => order == Ordering::Greater,
                CompareOperator::LessThanOrEqualTo => order != Ordering::Greater,
                CompareOperator::GreaterThanOrEqualTo => order != Ordering::Less,
                CompareOperator::EqualTo | CompareOperator::NotEqualTo => unreachable!(),
            }),
            None => Vector::null(),
        },
    }
}

/// The value-preserving exclusive-or: the single truthy operand, or false.
#[must_use]
pub fn xor_values(a: &Vector, b: &Vector) -> Vector {
    if !a.truthy() {
        b.clone()
    } else if !b.truthy() {
        a.clone()
    } else {
        false_vector()
    }
}

/// Materializes a range from vector operands: a null start defaults to zero
/// and a null step to one; a null stop yields null.
#[must_use]
pub fn range_of(start: &Vector, stop: &Vector, step: &Vector) -> Vector {
    let start = if start.is_null() { Some(0.0) } else { start.as_f64() };
    let step = if step.is_null() { Some(1.0) } else { step.as_f64() };
    match (start, stop.as_f64(), step) {
        (Some(start), Some(stop), Some(step)) => Vector::range(start, stop, step),
        _ => Vector::null(),
    }
}

/// Seconds from `MM:SS[.ms]` or `HH:MM:SS[.ms]`.
fn parse_timecode(text: &str) -> Option<f64> {
    let fields: Vec<&str> = text.split(':').collect();
    let (hours, minutes, seconds) = match fields.as_slice() {
        [m, s] => (0.0, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        [h, m, s] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        _ => return None,
    };
    if minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some((hours * 60.0 + minutes) * 60.0 + seconds)
}

/// Formats a number the way vectors display: integral values without a
/// decimal point, everything else through ryu.
#[must_use]
pub fn format_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        ryu::Buffer::new().format(x).to_owned()
    }
}

impl Eq for Vector {}

impl std::hash::Hash for Vector {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.stable_hash(false));
    }
}

impl Default for Vector {
    fn default() -> Self {
        Self::null()
    }
}

impl From<f64> for Vector {
    fn from(x: f64) -> Self {
        Self::Numbers(vec![x])
    }
}

impl From<bool> for Vector {
    fn from(value: bool) -> Self {
        Self::boolean(value)
    }
}

impl From<Vec<f64>> for Vector {
    fn from(xs: Vec<f64>) -> Self {
        Self::Numbers(xs)
    }
}

impl From<&str> for Vector {
    fn from(text: &str) -> Self {
        Self::Symbols(vec![Symbol::new(text)])
    }
}

impl From<Arc<Node>> for Vector {
    fn from(node: Arc<Node>) -> Self {
        Self::Nodes(vec![node])
    }
}

impl From<Node> for Vector {
    fn from(node: Node) -> Self {
        Self::Nodes(vec![Arc::new(node)])
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numbers(xs) if xs.is_empty() => f.write_str("null"),
            Self::Numbers(xs) => {
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    f.write_str(&format_number(*x))?;
                }
                Ok(())
            }
            Self::Symbols(xs) => {
                for (i, s) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{s}")?;
                }
                Ok(())
            }
            Self::Nodes(xs) => write!(f, "({} nodes)", xs.len()),
            Self::Builtin(b) => write!(f, "{}", b.name()),
            Self::Closure(c) => write!(f, "{}()", c.function.name),
            Self::Random(_) => f.write_str("(random)"),
        }
    }
}
