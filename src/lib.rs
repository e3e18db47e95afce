//! Library to back up the web sites of a host.
//!
//! Sites are discovered from the virtual-host configuration of the web server
//! ([`sites`]); for every site the document root is archived and, if the
//! site's env file names a database, the database is dumped ([`backends`]).
//! Sites of a remote host are reached over SSH ([`remote`]). The
//! [`orchestrator`] runs all units of a run and collects their results.

#![forbid(unsafe_code)]

pub mod archive;
pub mod backends;
pub mod change;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod remote;
pub mod sites;
pub mod util;
