//! replog: a small cluster of worker nodes that serialize externally
//! submitted commands (file uploads, trained-model registrations) through a
//! replicated consensus log. Clients may contact any node; only the elected
//! leader accepts writes, and followers answer with a redirect to it.

pub mod client;
pub mod config;
pub mod error;
pub mod frontend;
pub mod monitor;
pub mod raft;
pub mod worker;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use frontend::FrontEnd;
pub use raft::{Applicator, NodeStatus, RaftNode, Role, SubmitOutcome};
pub use worker::Worker;
