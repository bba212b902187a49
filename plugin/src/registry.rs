// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Static registry of plugin factories across all linked crates.
//!
//! Factories register themselves into a link-time slice; the lookup index is
//! built once on first use and read-only thereafter. This is the only piece
//! of process-global state in the engine.

use crate::PluginError;
use crate::traits::{Capturer, Parser, Processor, Reporter};
use linkme::distributed_slice;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// The four plugin roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Capturer,
    Parser,
    Processor,
    Reporter,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginKind::Capturer => "capturer",
            PluginKind::Parser => "parser",
            PluginKind::Processor => "processor",
            PluginKind::Reporter => "reporter",
        };
        f.write_str(s)
    }
}

/// Constructor for one plugin role.
pub enum PluginCtor {
    Capturer(fn() -> Box<dyn Capturer>),
    Parser(fn() -> Box<dyn Parser>),
    Processor(fn() -> Box<dyn Processor>),
    Reporter(fn() -> Box<dyn Reporter>),
}

impl PluginCtor {
    #[must_use]
    pub fn kind(&self) -> PluginKind {
        match self {
            PluginCtor::Capturer(_) => PluginKind::Capturer,
            PluginCtor::Parser(_) => PluginKind::Parser,
            PluginCtor::Processor(_) => PluginKind::Processor,
            PluginCtor::Reporter(_) => PluginKind::Reporter,
        }
    }
}

/// One entry in the factory slice.
pub struct PluginRegistration {
    pub name: &'static str,
    pub ctor: PluginCtor,
}

impl PluginRegistration {
    #[must_use]
    pub const fn new(name: &'static str, ctor: PluginCtor) -> Self {
        Self { name, ctor }
    }
}

/// Every plugin registration linked into the binary.
#[distributed_slice]
pub static PLUGINS: [PluginRegistration];

fn index() -> &'static HashMap<(PluginKind, String), &'static PluginRegistration> {
    static INDEX: OnceLock<HashMap<(PluginKind, String), &'static PluginRegistration>> =
        OnceLock::new();
    INDEX.get_or_init(|| {
        PLUGINS
            .iter()
            .map(|reg| ((reg.ctor.kind(), reg.name.to_owned()), reg))
            .collect()
    })
}

/// Resolve a registration by kind and name without instantiating it.
///
/// # Errors
///
/// Returns [`PluginError::NotFound`] for unknown names.
pub fn lookup(kind: PluginKind, name: &str) -> Result<&'static PluginRegistration, PluginError> {
    index()
        .get(&(kind, name.to_owned()))
        .copied()
        .ok_or_else(|| PluginError::NotFound {
            kind,
            name: name.to_owned(),
        })
}

/// Instantiate a capturer by name.
///
/// # Errors
///
/// Returns [`PluginError::NotFound`] for unknown names.
pub fn new_capturer(name: &str) -> Result<Box<dyn Capturer>, PluginError> {
    match lookup(PluginKind::Capturer, name)?.ctor {
        PluginCtor::Capturer(ctor) => Ok(ctor()),
        _ => unreachable!("registry index is keyed by kind"),
    }
}

/// Instantiate a parser by name.
///
/// # Errors
///
/// Returns [`PluginError::NotFound`] for unknown names.
pub fn new_parser(name: &str) -> Result<Box<dyn Parser>, PluginError> {
    match lookup(PluginKind::Parser, name)?.ctor {
        PluginCtor::Parser(ctor) => Ok(ctor()),
        _ => unreachable!("registry index is keyed by kind"),
    }
}

/// Instantiate a processor by name.
///
/// # Errors
///
/// Returns [`PluginError::NotFound`] for unknown names.
pub fn new_processor(name: &str) -> Result<Box<dyn Processor>, PluginError> {
    match lookup(PluginKind::Processor, name)?.ctor {
        PluginCtor::Processor(ctor) => Ok(ctor()),
        _ => unreachable!("registry index is keyed by kind"),
    }
}

/// Instantiate a reporter by name.
///
/// # Errors
///
/// Returns [`PluginError::NotFound`] for unknown names.
pub fn new_reporter(name: &str) -> Result<Box<dyn Reporter>, PluginError> {
    match lookup(PluginKind::Reporter, name)?.ctor {
        PluginCtor::Reporter(ctor) => Ok(ctor()),
        _ => unreachable!("registry index is keyed by kind"),
    }
}
