#![doc = include_str!("../../../README.md")]

mod cache;
mod clock;
mod engine;
mod errors;
mod evaluate;
mod functions;
mod hashing;
mod noise;
mod nodes;
mod render;
mod simplify;
mod state;
mod symbols;
mod tree;
mod values;

pub use crate::{
    cache::{
        AssetDecoders, CachePath, FileCache, ImageData, LoadedProgram, MeshData, ProgramParser, VideoFrame,
        VideoStream,
    },
    clock::BeatCounter,
    engine::{Engine, EngineCommand, EngineConfig, EngineHandle},
    errors::{EngineError, ParseError, RenderError},
    evaluate::{Context, ModuleExports, evaluate},
    functions::{BuiltinFunction, StaticName, resolve_static},
    nodes::{Node, NodeQuery},
    render::{FrameVars, References, Renderer, RendererFactory, RendererProxy, RendererRegistry, UpdateArgs},
    simplify::{NameBinding, Names, Simplification},
    state::{GlobalState, StateDict},
    symbols::Symbol,
    tree::{
        Binding, CompareOperator, Expression, FunctionDef, IfCondition, LogicOperator, MathOperator, PolyBinding,
        Top, UnaryOperator,
    },
    values::{
        Closure, Distribution, RandomSource, Vector, apply_compare, apply_math, apply_unary, false_vector,
        format_number, range_of, true_vector, xor_values,
    },
};
