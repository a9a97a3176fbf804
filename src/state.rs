//! Daemon state: outputs, animations and their assignment
//!
//! Every output is either idle or assigned to exactly one animation, recorded
//! both on the output ([`Assignment`]) and in the animation's output list.
//! Reconciliation rebuilds the whole mapping from the configuration; output
//! and animation counts are small enough that nothing is done incrementally.

use crate::animation::{Animation, AnimationId};
use crate::buffer::Allocator;
use crate::config::{ConfigError, OutputConfigs};
use crate::decoder::Decoder;
use crate::output::{Assignment, Output, OutputId, Surface};
use mio::Registry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Buffers every configured output keeps at minimum
const MIN_BUFFERS: usize = 2;

/// Source name for configuration arriving over the control socket
const IPC_SOURCE: &str = "ipc";

pub struct State {
    config_path: PathBuf,
    configs: OutputConfigs,
    outputs: BTreeMap<OutputId, Output>,
    animations: BTreeMap<AnimationId, Animation>,
    next_animation: usize,
    decoder: Box<dyn Decoder>,
    allocator: Box<dyn Allocator>,
    /// Registry the animation timers are polled through
    registry: Registry,
}

impl State {
    pub fn new(
        config_path: PathBuf,
        configs: OutputConfigs,
        decoder: Box<dyn Decoder>,
        allocator: Box<dyn Allocator>,
        registry: Registry,
    ) -> Self {
        Self {
            config_path,
            configs,
            outputs: BTreeMap::new(),
            animations: BTreeMap::new(),
            next_animation: 0,
            decoder,
            allocator,
            registry,
        }
    }

    pub fn outputs(&self) -> &BTreeMap<OutputId, Output> {
        &self.outputs
    }

    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub fn animations(&self) -> &BTreeMap<AnimationId, Animation> {
        &self.animations
    }

    /// Animation currently showing `path`
    pub fn animation_for(&self, path: &Path) -> Option<&Animation> {
        self.animations.values().find(|a| a.path() == path)
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    /// Track a new output. It stays idle until reconciled.
    pub fn add_output(&mut self, id: OutputId, surface: Box<dyn Surface>) {
        debug!("Adding {}", id);
        self.outputs.insert(id, Output::new(id, surface));
    }

    /// Record an output's name; returns whether it changed
    pub fn set_output_name(&mut self, id: OutputId, name: &str) -> bool {
        let Some(output) = self.outputs.get_mut(&id) else {
            return false;
        };
        if output.name.as_deref() == Some(name) {
            return false;
        }
        info!("{} is {}", id, name);
        output.name = Some(name.to_string());
        true
    }

    pub fn set_output_scale(&mut self, id: OutputId, scale: i32) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.scale == scale {
            return;
        }
        debug!("{} scale is now {}", output.label(), scale);
        output.scale = scale;
        output.reset_buffers();
        self.prepare_output(id);
    }

    /// Handle a size from the compositor
    pub fn configure_output(&mut self, id: OutputId, width: u32, height: u32) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.resize(width, height) {
            debug!("{} configured at {}x{}", output.label(), width, height);
            output.reset_buffers();
        }
        self.prepare_output(id);
    }

    /// Make sure the output has buffers and schedule a render on it
    fn prepare_output(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };

        if let Some(geometry) = output.geometry() {
            if let Err(e) = output.pool.ensure_count(MIN_BUFFERS, geometry, self.allocator.as_mut()) {
                warn!("Could not allocate buffers for {}: {}", output.label(), e);
            }
        }

        if let Assignment::Assigned(animation) = output.assignment {
            if let Some(animation) = self.animations.get(&animation) {
                animation.schedule(Duration::ZERO);
            }
        }
    }

    /// Forget an output that has gone away
    pub fn remove_output(&mut self, id: OutputId) {
        let Some(output) = self.outputs.remove(&id) else {
            return;
        };
        info!("Removing {}", output.label());

        if let Assignment::Assigned(animation_id) = output.assignment {
            let empty = match self.animations.get_mut(&animation_id) {
                Some(animation) => {
                    animation.detach(id);
                    animation.outputs().is_empty()
                }
                None => false,
            };
            if empty {
                self.destroy_animation(animation_id);
            }
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Apply a configuration payload, then reconcile.
    ///
    /// Lines before a bad line stay applied.
    pub fn configure(&mut self, payload: &str) -> Result<(), ConfigError> {
        let result = self.configs.apply(payload, IPC_SOURCE);
        self.reconfigure();
        result
    }

    /// Replace the whole configuration, then reconcile
    pub fn set_configs(&mut self, configs: OutputConfigs) {
        self.configs = configs;
        self.reconfigure();
    }

    /// Re-read the configuration file and decode every image again
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let configs = OutputConfigs::load(&self.config_path)?;
        info!("Reloading with {} output configurations", configs.len());

        let ids: Vec<AnimationId> = self.animations.keys().copied().collect();
        for id in ids {
            self.destroy_animation(id);
        }
        self.set_configs(configs);
        Ok(())
    }

    /// Rebuild the assignment of every output
    pub fn reconfigure(&mut self) {
        for animation in self.animations.values_mut() {
            animation.detach_all();
        }
        for output in self.outputs.values_mut() {
            output.assignment = Assignment::Idle;
        }

        let ids: Vec<OutputId> = self.outputs.keys().copied().collect();
        for id in ids {
            self.assign(id);
        }

        let unused: Vec<AnimationId> = self
            .animations
            .values()
            .filter(|a| a.outputs().is_empty())
            .map(|a| a.id())
            .collect();
        for id in unused {
            self.destroy_animation(id);
        }
    }

    /// Resolve an idle output's configuration and attach it to an animation
    fn assign(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };

        // Outputs without a name only match the wildcard
        output.config = self
            .configs
            .resolve(output.name.as_deref().unwrap_or_default())
            .cloned();
        output.invalidate();

        let Some(path) = output.config.as_ref().and_then(|c| c.image.clone()) else {
            debug!("No image configured for {}", output.label());
            return;
        };
        let label = output.label();

        let existing = self.animation_for(&path).map(Animation::id);
        let Some(animation_id) = existing.or_else(|| self.create_animation(&path)) else {
            return;
        };

        if let Some(output) = self.outputs.get_mut(&id) {
            output.assignment = Assignment::Assigned(animation_id);
        }
        if let Some(animation) = self.animations.get_mut(&animation_id) {
            animation.attach(id);
            animation.schedule(Duration::ZERO);
        }
        debug!("{} assigned to animation {}", label, animation_id);
    }

    // ========================================================================
    // Animations
    // ========================================================================

    fn create_animation(&mut self, path: &Path) -> Option<AnimationId> {
        let id = AnimationId(self.next_animation);
        self.next_animation += 1;

        match Animation::create(id, path, self.decoder.as_mut(), &self.registry) {
            Ok(animation) => {
                self.animations.insert(id, animation);
                Some(id)
            }
            Err(e) => {
                error!("Unable to create animation for {:?}: {}", path, e);
                None
            }
        }
    }

    fn destroy_animation(&mut self, id: AnimationId) {
        let Some(mut animation) = self.animations.remove(&id) else {
            return;
        };

        for output_id in animation.detach_all() {
            if let Some(output) = self.outputs.get_mut(&output_id) {
                output.assignment = Assignment::Idle;
            }
        }
        animation.deregister(&self.registry);
        info!("Animation {} for {:?} destroyed", id, animation.path());
    }

    /// Render an animation whose timer fired
    pub fn tick(&mut self, id: AnimationId, now: Instant) {
        let Some(animation) = self.animations.get_mut(&id) else {
            trace!("Timer event for destroyed animation {}", id);
            return;
        };

        animation.drain_timer();
        if let Some(delay) = animation.render(now, &mut self.outputs, self.allocator.as_mut()) {
            animation.schedule(delay);
        }
    }

    /// Destroy every animation and output
    pub fn teardown(&mut self) {
        let ids: Vec<AnimationId> = self.animations.keys().copied().collect();
        for id in ids {
            self.destroy_animation(id);
        }
        self.outputs.clear();
        debug!("State torn down");
    }
}
