#![deny(unsafe_op_in_unsafe_fn)]
#![doc = "stackio-core: the stack runtime shared by every composable stream/packet I/O endpoint."]
#![doc = ""]
#![doc = "== Scope =="]
#![doc = "This crate is the generic machinery common to every endpoint regardless of"]
#![doc = "transport or protocol: the Base Endpoint state machine, the FD Lower Layer,"]
#![doc = "the Filter/LowerLayer contracts they're built from, and the handful of"]
#![doc = "supporting pieces (OOB queue, Filter-as-LL bridge, accepter contract) those"]
#![doc = "two lean on. Concrete filters (TLS, message framing, multiplexing) and"]
#![doc = "concrete per-transport lower layers (TCP, UDP, serial, subprocess pipes) are"]
#![doc = "downstream crates that implement [`Filter`] and [`LowerLayer`]; none ship"]
#![doc = "here."]
#![doc = ""]
#![doc = "== Compatibility =="]
#![doc = "This crate follows SemVer 2.0. `Filter`, `LowerLayer`, and `OsFuncs` are the"]
#![doc = "contract surface downstream crates implement against; a breaking change to"]
#![doc = "any of their method signatures is a MAJOR bump."]

pub mod accepter;
pub mod bridge;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod fd_lower_layer;
pub mod filter;
pub mod lowerlayer;
pub mod oob;
pub mod osfuncs;

pub use endpoint::{Endpoint, EndpointEvents, EndpointState, Event};
pub use error::{ErrorKind, Result, StackError};
pub use filter::{Filter, FilterBaseCallback, Progress, Readiness};
pub use lowerlayer::{LowerLayer, LowerLayerEvents};
pub use osfuncs::OsFuncs;
