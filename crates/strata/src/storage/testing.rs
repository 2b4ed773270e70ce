//! Layer driver double shared by the orchestrator tests.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use strata_common::{StrataError, StrataResult};

use super::driver::LayerDriver;

/// Records driver calls and fails the named step.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    calls: Mutex<Vec<&'static str>>,
    fail: Vec<&'static str>,
}

impl ScriptedDriver {
    pub fn failing(steps: &[&'static str]) -> Self {
        Self {
            fail: steps.to_vec(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn step(&self, name: &'static str) -> StrataResult<()> {
        self.calls.lock().push(name);
        if self.fail.contains(&name) {
            return Err(StrataError::LayerDriver {
                operation: name.to_string(),
                layer: "scratch".to_string(),
                message: "scripted".to_string(),
            });
        }
        Ok(())
    }
}

impl LayerDriver for ScriptedDriver {
    fn activate(&self, _layer: &Path) -> StrataResult<()> {
        self.step("activate")
    }

    fn prepare(&self, _layer: &Path, _parents: &[PathBuf]) -> StrataResult<()> {
        self.step("prepare")
    }

    fn mount_path(&self, layer: &Path) -> StrataResult<PathBuf> {
        self.step("mount_path")?;
        Ok(layer.join("rootfs"))
    }

    fn unprepare(&self, _layer: &Path) -> StrataResult<()> {
        self.step("unprepare")
    }

    fn deactivate(&self, _layer: &Path) -> StrataResult<()> {
        self.step("deactivate")
    }
}
