//! Builtin functions and constants resolvable by the simplifier.
//!
//! Builtins are an enum rather than function pointers so that programs,
//! snapshots and folded literals can carry them by name. All builtins are
//! pure, null-propagating and vector-broadcasting, with the single exception
//! of `debug`, which forwards to the log side channel and is therefore never
//! folded at simplification time.

use std::f64::consts::TAU;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumString, IntoStaticStr};

use crate::{
    noise,
    symbols::Symbol,
    values::{Distribution, RandomSource, Vector, false_vector, true_vector},
};

/// The builtin functions the core resolves statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum BuiltinFunction {
    Sqrt,
    Sin,
    Cos,
    Tan,
    Hypot,
    Angle,
    Length,
    Ord,
    Chr,
    Split,
    Uniform,
    Normal,
    Beta,
    Noise,
    OctNoise,
    Debug,
}

/// Static resolution of an unbound name: a constant value, a foldable pure
/// function, or an impure function left dynamic.
#[derive(Debug, Clone)]
pub enum StaticName {
    Constant(Vector),
    Pure(BuiltinFunction),
    Impure(BuiltinFunction),
}

/// Resolves `null`, `true`, `false` and the builtin function names.
#[must_use]
pub fn resolve_static(name: Symbol) -> Option<StaticName> {
    match name.as_str() {
        "null" => Some(StaticName::Constant(Vector::null())),
        "true" => Some(StaticName::Constant(true_vector())),
        "false" => Some(StaticName::Constant(false_vector())),
        text => BuiltinFunction::from_str(text).ok().map(|function| {
            if function.is_pure() {
                StaticName::Pure(function)
            } else {
                StaticName::Impure(function)
            }
        }),
    }
}

impl BuiltinFunction {
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    #[must_use]
    pub fn is_pure(self) -> bool {
        !matches!(self, Self::Debug)
    }

    /// Parameter names, for binding keyword arguments positionally.
    #[must_use]
    pub fn parameters(self) -> &'static [&'static str] {
        match self {
            Self::Sqrt | Self::Hypot | Self::Angle | Self::Length => &["xs"],
            Self::Sin | Self::Cos | Self::Tan => &["theta"],
            Self::Ord => &["text"],
            Self::Chr => &["codes"],
            Self::Split => &["text", "separator"],
            Self::Uniform | Self::Normal | Self::Beta => &["seed"],
            Self::Noise => &["seed", "x", "y", "z"],
            Self::OctNoise => &["seed", "octaves", "roughness", "x", "y", "z"],
            Self::Debug => &["value"],
        }
    }

    /// Arranges positional and keyword arguments into parameter order.
    /// Missing trailing parameters become `None`.
    pub fn bind_arguments(
        self,
        args: &[Vector],
        kwargs: &[(Symbol, Vector)],
    ) -> Result<Vec<Option<Vector>>, String> {
        let parameters = self.parameters();
        if args.len() > parameters.len() {
            return Err(format!(
                "{}() takes at most {} arguments, got {}",
                self.name(),
                parameters.len(),
                args.len()
            ));
        }
        let mut bound: Vec<Option<Vector>> = vec![None; parameters.len()];
        for (slot, arg) in bound.iter_mut().zip(args.iter()) {
            *slot = Some(arg.clone());
        }
        for (name, value) in kwargs {
            let Some(index) = parameters.iter().position(|p| *p == name.as_str()) else {
                return Err(format!("{}() has no argument '{}'", self.name(), name));
            };
            if bound[index].is_some() {
                return Err(format!("{}() got multiple values for '{}'", self.name(), name));
            }
            bound[index] = Some(value.clone());
        }
        Ok(bound)
    }

    /// Invokes the builtin. Type and shape mismatches come back as error
    /// strings for the caller's error channel; the result is null then.
    pub fn invoke(self, args: &[Vector], kwargs: &[(Symbol, Vector)]) -> Result<Vector, String> {
        let bound = self.bind_arguments(args, kwargs)?;
        let required = |index: usize| -> Result<&Vector, String> {
            bound[index]
                .as_ref()
                .ok_or_else(|| format!("{}() missing argument '{}'", self.name(), self.parameters()[index]))
        };
        match self {
            Self::Sqrt => Ok(required(0)?.map_numbers(f64::sqrt)),
            Self::Sin => Ok(required(0)?.map_numbers(|t| (t * TAU).sin())),
            Self::Cos => Ok(required(0)?.map_numbers(|t| (t * TAU).cos())),
            Self::Tan => Ok(required(0)?.map_numbers(|t| (t * TAU).tan())),
            Self::Hypot => {
                let Some(xs) = required(0)?.numbers() else {
                    return Ok(Vector::null());
                };
                if xs.is_empty() {
                    return Ok(Vector::null());
                }
                Ok(Vector::from(xs.iter().map(|x| x * x).sum::<f64>().sqrt()))
            }
            Self::Angle => {
                let Some(xs) = required(0)?.numbers() else {
                    return Ok(Vector::null());
                };
                match xs {
                    [x, y] => Ok(Vector::from(y.atan2(*x) / TAU)),
                    _ => Ok(Vector::null()),
                }
            }
            Self::Length => Ok(Vector::from(required(0)?.len() as f64)),
            Self::Ord => match required(0)? {
                Vector::Symbols(syms) => {
                    let codes: Vec<f64> = syms
                        .iter()
                        .flat_map(|s| s.as_str().chars())
                        .map(|c| f64::from(u32::from(c)))
                        .collect();
                    Ok(Vector::Numbers(codes))
                }
                _ => Ok(Vector::null()),
            },
            Self::Chr => {
                let Some(codes) = required(0)?.numbers() else {
                    return Ok(Vector::null());
                };
                let text: Option<String> = codes
                    .iter()
                    .map(|code| u32::try_from(code.floor() as i64).ok().and_then(char::from_u32))
                    .collect();
                Ok(text.map_or_else(Vector::null, |text| Vector::from(text.as_str())))
            }
            Self::Split => {
                let Vector::Symbols(syms) = required(0)? else {
                    return Ok(Vector::null());
                };
                let separator = match bound[1].as_ref() {
                    Some(sep) => sep.as_string().ok_or_else(|| "split() separator must be a string".to_owned())?,
                    None => "\n".to_owned(),
                };
                let parts: Vec<Symbol> = syms
                    .iter()
                    .flat_map(|s| s.as_str().split(separator.as_str()))
                    .filter(|part| !part.is_empty())
                    .map(Symbol::new)
                    .collect();
                Ok(Vector::Symbols(parts))
            }
            Self::Uniform | Self::Normal | Self::Beta => {
                let seed = bound[0].clone().unwrap_or_else(Vector::null);
                let kind = match self {
                    Self::Uniform => Distribution::Uniform,
                    Self::Normal => Distribution::Normal,
                    _ => Distribution::Beta,
                };
                Ok(Vector::Random(RandomSource::new(kind, &seed)))
            }
            Self::Noise => {
                let seed = required(0)?.stable_hash(true);
                let coords: Vec<&Vector> = bound[1..].iter().flatten().collect();
                sample_noise(seed, &coords, |seed, point| noise::sample(seed, point))
            }
            Self::OctNoise => {
                let seed = required(0)?.stable_hash(true);
                let Some(octaves) = required(1)?.as_f64() else {
                    return Ok(Vector::null());
                };
                let Some(roughness) = required(2)?.as_f64() else {
                    return Ok(Vector::null());
                };
                let octaves = octaves.max(1.0) as u32;
                let coords: Vec<&Vector> = bound[3..].iter().flatten().collect();
                sample_noise(seed, &coords, move |seed, point| {
                    noise::octave_sample(seed, octaves, roughness, point)
                })
            }
            Self::Debug => Ok(required(0)?.clone()),
        }
    }
}

/// Broadcasts the coordinate vectors to their maximum length and samples the
/// noise field at each resulting point. A null coordinate propagates.
fn sample_noise(
    seed: u64,
    coords: &[&Vector],
    field: impl Fn(u64, &[f64]) -> f64,
) -> Result<Vector, String> {
    if coords.is_empty() || coords.len() > 3 {
        return Err("noise() requires 1 to 3 coordinate vectors".to_owned());
    }
    let mut lanes: Vec<&[f64]> = Vec::with_capacity(coords.len());
    for coord in coords {
        match coord.numbers() {
            Some(xs) if !xs.is_empty() => lanes.push(xs),
            _ => return Ok(Vector::null()),
        }
    }
    let count = lanes.iter().map(|xs| xs.len()).max().unwrap_or(0);
    let mut point = vec![0.0; lanes.len()];
    let values: Vec<f64> = (0..count)
        .map(|i| {
            for (slot, lane) in point.iter_mut().zip(lanes.iter()) {
                *slot = lane[i % lane.len()];
            }
            field(seed, &point)
        })
        .collect();
    Ok(Vector::Numbers(values))
}
