//! Lattice geometry support for determinantal QMC on the square lattice.
//!
//! Provides site indexing and neighbor tables for an L x L torus with
//! periodic or anti-periodic boundary conditions, the periodic
//! imaginary-time chain, and the plaquette enumeration used by the
//! checkerboard break-up of the hopping exponential.

pub mod chain;
pub mod grid;

pub use chain::TimeChain;
pub use grid::{BoundaryCondition, Dir, Plaquette, SquareLattice};
