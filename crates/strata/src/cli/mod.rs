//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use serde_json::json;
use strata_common::{HostingSystemId, LayerGuid, StrataPaths};

use crate::config::StorageConfig;
use crate::control::RecordingControlPlane;
use crate::storage::layer::UTILITY_VM_FOLDER;
use crate::storage::{
    HostingSystem, LayerMounter, LayerStack, OverlayLayerDriver, UnmountScope, UtilityVmSpec,
};

/// Strata - layer mount orchestration
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for strata data
    #[arg(
        long,
        global = true,
        env = "STRATA_ROOT",
        default_value = "/var/lib/strata"
    )]
    pub root: PathBuf,

    /// Configuration file (TOML or JSON)
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Operations `plan` can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanOperation {
    /// Mount into a hosting system.
    Mount,
    /// Mount, then unmount with the given scope.
    Unmount,
}

/// Strata subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Print the identifier derived from a layer folder name
    Guid {
        /// Folder name
        name: String,
    },

    /// Mount a layer stack on the host
    Mount {
        /// Layer folders, base first and scratch last
        #[arg(required = true, num_args = 2..)]
        layers: Vec<PathBuf>,
    },

    /// Unmount a layer stack from the host
    Unmount {
        /// Layer folders, base first and scratch last
        #[arg(required = true)]
        layers: Vec<PathBuf>,
    },

    /// Show the requests a hosted mount or unmount would send
    Plan {
        /// Operation to plan
        #[arg(value_enum)]
        operation: PlanOperation,

        /// Hosting system ID
        #[arg(long, default_value = "uvm")]
        hosting_system: String,

        /// Unmount scope (scratch, shares, all)
        #[arg(long, default_value = "all")]
        scope: UnmountScope,

        /// Layer folders, base first and scratch last
        #[arg(required = true, num_args = 2..)]
        layers: Vec<PathBuf>,
    },

    /// Print a utility VM creation document
    UvmDocument {
        /// Hosting system ID
        #[arg(long, default_value = "uvm")]
        id: String,

        /// Folder holding the VM's scratch disk (default: under the root)
        #[arg(long)]
        layer: Option<PathBuf>,

        /// Utility VM image folder
        #[arg(long, required_unless_present = "from_layers")]
        image: Option<PathBuf>,

        /// Find the image in the base-most layer that carries one
        #[arg(long, num_args = 1.., conflicts_with = "image")]
        from_layers: Vec<PathBuf>,

        /// Startup memory in MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Virtual processor count
        #[arg(long)]
        processors: Option<u32>,
    },
}

impl Cli {
    /// Load the storage configuration selected by the global options.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be parsed.
    pub fn storage_config(&self) -> Result<StorageConfig> {
        let config = match &self.config {
            Some(path) => StorageConfig::from_file(path)
                .wrap_err_with(|| format!("Failed to load config {}", path.display()))?
                .with_root(self.root.clone()),
            None => StorageConfig::load(StrataPaths::with_root(self.root.clone()))
                .wrap_err("Failed to load config under the root directory")?,
        };
        Ok(config)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.storage_config()?;

        match self.command {
            Commands::Guid { name } => {
                println!("{}", LayerGuid::derive(&name));
                Ok(())
            }

            Commands::Mount { layers } => {
                let stack = layer_stack(&config, layers)?;
                let mounter = LayerMounter::from_config(&config, Arc::new(OverlayLayerDriver::new()));

                let mounted = mounter
                    .mount(&stack, None)
                    .await
                    .wrap_err("Failed to mount layers")?;

                if let Some(path) = mounted.host_path() {
                    println!("{}", path.display());
                }
                Ok(())
            }

            Commands::Unmount { layers } => {
                let stack = layer_stack(&config, layers)?;
                let mounter = LayerMounter::from_config(&config, Arc::new(OverlayLayerDriver::new()));

                mounter
                    .unmount(&stack, None, UnmountScope::ALL)
                    .await
                    .wrap_err("Failed to unmount layers")?;

                println!("Unmounted {}", stack.scratch().display());
                Ok(())
            }

            Commands::Plan {
                operation,
                hosting_system,
                scope,
                layers,
            } => {
                let stack = layer_stack(&config, layers)?;
                let plan = plan(&config, operation, &hosting_system, scope, &stack).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                Ok(())
            }

            Commands::UvmDocument {
                id,
                layer,
                image,
                from_layers,
                memory_mb,
                processors,
            } => {
                let id = HostingSystemId::new(id)?;
                let layer = layer.unwrap_or_else(|| config.paths.hosting_system(id.as_str()));
                let image = match image {
                    Some(image) => image,
                    None => layer_stack(&config, from_layers)?
                        .utility_vm_folder()?
                        .join(UTILITY_VM_FOLDER),
                };

                let mut spec = UtilityVmSpec::new(id, layer, image);
                spec.memory_mb = memory_mb;
                spec.processors = processors;

                let document = spec.document(&config.utility_vm, &config.scratch_disk_name)?;
                println!("{}", serde_json::to_string_pretty(&document)?);
                Ok(())
            }
        }
    }
}

/// Relative layer paths are resolved under the layer store.
fn layer_stack(config: &StorageConfig, layers: Vec<PathBuf>) -> Result<LayerStack> {
    let resolved = layers.into_iter().map(|layer| {
        if layer.is_absolute() {
            layer
        } else {
            config.paths.layers().join(layer)
        }
    });
    Ok(LayerStack::new(resolved)?)
}

/// Run a hosted mount, and optionally the matching unmount, against a
/// recording control plane.
async fn plan(
    config: &StorageConfig,
    operation: PlanOperation,
    hosting_system: &str,
    scope: UnmountScope,
    stack: &LayerStack,
) -> Result<serde_json::Value> {
    let control = Arc::new(RecordingControlPlane::new(hosting_system));
    let hosting = HostingSystem::new(
        HostingSystemId::new(hosting_system)?,
        control.clone(),
        config.guest.clone(),
    );
    let mounter = LayerMounter::from_config(config, Arc::new(OverlayLayerDriver::new()));

    let mounted = mounter
        .mount(stack, Some(&hosting))
        .await
        .wrap_err("Planned mount failed")?;
    let mount_requests = control.documents()?.len();

    if operation == PlanOperation::Unmount {
        mounter
            .unmount(stack, Some(&hosting), scope)
            .await
            .wrap_err("Planned unmount failed")?;
    }

    let requests: Vec<_> = match operation {
        PlanOperation::Mount => control.documents()?,
        PlanOperation::Unmount => control.documents()?.split_off(mount_requests),
    };

    Ok(json!({
        "hosting_system": hosting_system,
        "scratch": display(stack.scratch()),
        "requests": requests,
        "mounted": mounted,
        "snapshot": hosting.snapshot().await,
    }))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn relative_layers_resolve_under_root() {
        let config = StorageConfig::default().with_root("/srv/strata");
        let stack = layer_stack(
            &config,
            vec![PathBuf::from("base"), PathBuf::from("/scratch/w1")],
        )
        .unwrap();
        assert_eq!(
            stack.layers(),
            &[
                PathBuf::from("/srv/strata/layers/base"),
                PathBuf::from("/scratch/w1")
            ]
        );
    }

    #[tokio::test]
    async fn plan_unmount_lists_only_teardown() {
        let config = StorageConfig::default();
        let stack = LayerStack::new(["/l/base", "/l/scratch"]).unwrap();

        let plan = plan(
            &config,
            PlanOperation::Unmount,
            "uvm",
            UnmountScope::ALL,
            &stack,
        )
        .await
        .unwrap();

        let requests = plan["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r["RequestType"] == "Remove"));
        assert_eq!(plan["snapshot"]["shares"], json!({}));
    }
}
