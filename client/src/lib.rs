//! # Tank Arena Client
//!
//! Client for the tank arena. The local tank is predicted with the same step
//! function the server runs, remote tanks and bullets are interpolated from a
//! short buffer of server snapshots, and the predicted tank is continuously
//! reconciled against the server's view of it.
//!
//! - [`buffer`]: time-windowed snapshot history
//! - [`game`]: prediction, interpolation and reconciliation
//! - [`input`]: keyboard and mouse capture, sequencing, fixed-rate pacing
//! - [`network`]: socket thread, session state and the frame loop
//! - [`rendering`]: drawing the arena and HUD
//!
//! Keys 1, 2 and 3 switch prediction, reconciliation and interpolation off and
//! on at runtime to compare their effect.

pub mod buffer;
pub mod game;
pub mod input;
pub mod network;
pub mod rendering;
