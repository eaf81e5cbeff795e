//! Command-line interface definitions for the `forester` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `forester` binary.
#[derive(Debug, Parser)]
#[command(
    name = "forester",
    about = "Provision and tear down multi-node Scaleway clusters tracked in a shared registry",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a new forest.
    #[command(name = "create", about = "Provision a new forest")]
    Create(CreateCommand),
    /// Add nodes to an active forest.
    #[command(name = "grow", about = "Add nodes to an active forest")]
    Grow(GrowCommand),
    /// Delete every server of a forest and forget it.
    #[command(name = "destroy", about = "Delete every server of a forest and forget it")]
    Destroy(ForestArg),
    /// List registered forests.
    #[command(name = "list", about = "List registered forests")]
    List,
    /// Show a forest and its nodes.
    #[command(name = "status", about = "Show a forest and its nodes")]
    Status(ForestArg),
    /// Check that the registry is reachable and accepts the credentials.
    #[command(name = "check", about = "Check registry connectivity")]
    Check,
}

/// Arguments for `forester create`.
#[derive(Debug, Parser)]
pub(crate) struct CreateCommand {
    /// Number of nodes to provision.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) nodes: u32,
    /// Preferred zone; repeat to give an ordered list.
    ///
    /// Overrides `preferred_zones` from configuration.
    #[arg(long = "zone", value_name = "ZONE")]
    pub(crate) zones: Vec<String>,
    /// Primary commercial type; defaults to `SCW_DEFAULT_INSTANCE_TYPE`.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Fallback commercial type tried when the primary one has no capacity;
    /// repeat to give an ordered list.
    ///
    /// Overrides `fallback_instance_types` from configuration.
    #[arg(long = "fallback-type", value_name = "TYPE")]
    pub(crate) fallback_types: Vec<String>,
    /// Only try the given zones instead of falling back to any available one.
    #[arg(long, requires = "zones")]
    pub(crate) pinned: bool,
    /// Image label or identifier; defaults to `SCW_DEFAULT_IMAGE`.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Explicit forest identifier instead of a generated one.
    #[arg(long, value_name = "ID")]
    pub(crate) forest_id: Option<String>,
}

/// Arguments for `forester grow`.
#[derive(Debug, Parser)]
pub(crate) struct GrowCommand {
    /// Forest identifier.
    #[arg(value_name = "FOREST")]
    pub(crate) forest_id: String,
    /// Number of nodes to add.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) nodes: u32,
}

/// A single forest identifier.
#[derive(Debug, Parser)]
pub(crate) struct ForestArg {
    /// Forest identifier.
    #[arg(value_name = "FOREST")]
    pub(crate) forest_id: String,
}
