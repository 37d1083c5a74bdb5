pub mod mapmaker;
pub mod noise;
pub mod pcg;
pub mod projection;

pub use mapmaker::{MapMaker, MapMakerReport, SolveSummary};
pub use noise::NoiseMatrix;
pub use pcg::{DestripingSystem, NormalEquations, PcgOutcome, PcgSolver, SolveStatus};
pub use projection::ProjectionMatrix;
