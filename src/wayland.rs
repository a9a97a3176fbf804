//! Wayland connection: globals, outputs and layer surfaces
//!
//! [`Wayland`] is the dispatch target of the event queue. It owns the daemon
//! [`State`] and translates protocol events into state operations. Every
//! output gets a background layer surface covering it entirely.

use crate::buffer::{Buffer, BufferState, SharedState};
use crate::config::OutputConfigs;
use crate::decoder::FileDecoder;
use crate::output::{OutputId, Surface};
use crate::shm::ShmAllocator;
use crate::state::State;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use wayland_client::globals::{GlobalListContents, registry_queue_init};
use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_region::WlRegion;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, delegate_noop};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_v1::{self, ZxdgOutputV1};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_shell_v1::{Layer, ZwlrLayerShellV1};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1::{
    self, Anchor, ZwlrLayerSurfaceV1,
};

/// Layer shell namespace of the wallpaper surfaces
const NAMESPACE: &str = "wallpaper";

/// Highest `wl_output` version used (adds `name`)
const OUTPUT_VERSION: u32 = 4;

/// Highest `zwlr_layer_shell_v1` version used (adds `destroy`)
const LAYER_SHELL_VERSION: u32 = 3;

/// User data of a layer surface
pub struct LayerData {
    output: OutputId,
    surface: WlSurface,
}

/// Background layer surface on one output
pub struct LayerSurface {
    output: WlOutput,
    xdg_output: Option<ZxdgOutputV1>,
    surface: WlSurface,
    layer: ZwlrLayerSurfaceV1,
}

impl Surface for LayerSurface {
    fn present(&mut self, buffer: &Buffer, scale: i32, width: u32, height: u32) {
        let Some(handle) = buffer.handle() else {
            return;
        };
        self.surface.set_buffer_scale(scale);
        self.surface.attach(Some(handle), 0, 0);
        self.surface.damage(0, 0, width as i32, height as i32);
        self.surface.commit();
    }
}

impl Drop for LayerSurface {
    fn drop(&mut self) {
        self.layer.destroy();
        self.surface.destroy();
        if let Some(xdg_output) = self.xdg_output.take() {
            xdg_output.destroy();
        }
        if self.output.version() >= 3 {
            self.output.release();
        }
    }
}

/// Dispatch target of the Wayland event queue
pub struct Wayland {
    pub state: State,
    compositor: WlCompositor,
    layer_shell: ZwlrLayerShellV1,
    output_manager: Option<ZxdgOutputManagerV1>,
    /// Outputs that have not announced all their properties yet
    pending: BTreeSet<OutputId>,
    /// Output names changed since the last reconciliation
    dirty: bool,
}

/// Connect to the compositor and bind the globals the daemon needs
pub fn connect(
    config_path: PathBuf,
    configs: OutputConfigs,
    registry: mio::Registry,
) -> Result<(Connection, EventQueue<Wayland>, Wayland)> {
    let conn = Connection::connect_to_env().context("Unable to connect to the Wayland display")?;
    let (globals, queue) = registry_queue_init::<Wayland>(&conn).context("Unable to read Wayland globals")?;
    let qh = queue.handle();

    let compositor: WlCompositor = globals
        .bind(&qh, 4..=4, ())
        .context("Compositor does not support wl_compositor v4")?;
    let shm: WlShm = globals.bind(&qh, 1..=1, ()).context("Compositor does not support wl_shm")?;
    let layer_shell: ZwlrLayerShellV1 = globals
        .bind(&qh, 1..=LAYER_SHELL_VERSION, ())
        .context("Compositor does not support zwlr_layer_shell_v1")?;
    let output_manager: Option<ZxdgOutputManagerV1> = globals.bind(&qh, 2..=3, ()).ok();
    if output_manager.is_none() {
        info!("zxdg_output_manager_v1 not available, using wl_output names");
    }

    let state = State::new(
        config_path,
        configs,
        Box::new(FileDecoder),
        Box::new(ShmAllocator::new(shm, qh.clone())),
        registry,
    );

    let mut wayland = Wayland {
        state,
        compositor,
        layer_shell,
        output_manager,
        pending: BTreeSet::new(),
        dirty: false,
    };

    for global in globals.contents().clone_list() {
        if global.interface == WlOutput::interface().name {
            let output: WlOutput = globals.registry().bind(
                global.name,
                global.version.min(OUTPUT_VERSION),
                &qh,
                OutputId(global.name),
            );
            wayland.add_output(OutputId(global.name), output, &qh);
        }
    }

    Ok((conn, queue, wayland))
}

impl Wayland {
    /// Create the layer surface for a newly bound output
    fn add_output(&mut self, id: OutputId, output: WlOutput, qh: &QueueHandle<Self>) {
        let surface = self.compositor.create_surface(qh, ());

        // Never take pointer or touch input
        let input = self.compositor.create_region(qh, ());
        surface.set_input_region(Some(&input));
        input.destroy();

        let layer = self.layer_shell.get_layer_surface(
            &surface,
            Some(&output),
            Layer::Background,
            NAMESPACE.to_string(),
            qh,
            LayerData {
                output: id,
                surface: surface.clone(),
            },
        );
        layer.set_size(0, 0);
        layer.set_anchor(Anchor::Top | Anchor::Right | Anchor::Bottom | Anchor::Left);
        layer.set_exclusive_zone(-1);
        surface.commit();

        let xdg_output = self
            .output_manager
            .as_ref()
            .map(|manager| manager.get_xdg_output(&output, qh, id));

        self.pending.insert(id);
        self.state.add_output(
            id,
            Box::new(LayerSurface {
                output,
                xdg_output,
                surface,
                layer,
            }),
        );
    }

    fn remove_output(&mut self, id: OutputId) {
        self.pending.remove(&id);
        self.state.remove_output(id);
    }

    fn set_name(&mut self, id: OutputId, name: &str) {
        if self.state.set_output_name(id, name) {
            self.dirty = true;
        }
    }

    /// An output finished announcing its properties
    fn announced(&mut self, id: OutputId) {
        if self.pending.remove(&id) {
            self.dirty = true;
        }
    }

    /// Destroy every surface, then release the globals that allow it
    pub fn teardown(&mut self) {
        self.state.teardown();
        self.pending.clear();
        if self.layer_shell.version() >= 3 {
            self.layer_shell.destroy();
        }
        if let Some(manager) = self.output_manager.take() {
            manager.destroy();
        }
    }

    /// Reconcile if output names changed; returns whether it did
    pub fn reconcile_if_dirty(&mut self) -> bool {
        if !std::mem::take(&mut self.dirty) {
            return false;
        }
        self.state.reconfigure();
        true
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for Wayland {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } if interface == WlOutput::interface().name => {
                debug!("New output global {}", name);
                let output: WlOutput = registry.bind(name, version.min(OUTPUT_VERSION), qh, OutputId(name));
                state.add_output(OutputId(name), output, qh);
            }
            wl_registry::Event::GlobalRemove { name } => {
                if state.state.output(OutputId(name)).is_some() {
                    state.remove_output(OutputId(name));
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, OutputId> for Wayland {
    fn event(
        state: &mut Self,
        _output: &WlOutput,
        event: wl_output::Event,
        id: &OutputId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_output::Event::Scale { factor } => state.state.set_output_scale(*id, factor),
            wl_output::Event::Name { name } if state.output_manager.is_none() => {
                state.set_name(*id, &name);
            }
            wl_output::Event::Done => state.announced(*id),
            _ => {}
        }
    }
}

impl Dispatch<ZxdgOutputV1, OutputId> for Wayland {
    fn event(
        state: &mut Self,
        _output: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        id: &OutputId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zxdg_output_v1::Event::Name { name } => state.set_name(*id, &name),
            zxdg_output_v1::Event::Done => state.announced(*id),
            _ => {}
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, LayerData> for Wayland {
    fn event(
        state: &mut Self,
        layer: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        data: &LayerData,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                layer.ack_configure(serial);

                // The wallpaper is the lowest surface, all of it is opaque
                let opaque = state.compositor.create_region(qh, ());
                opaque.add(0, 0, width as i32, height as i32);
                data.surface.set_opaque_region(Some(&opaque));
                opaque.destroy();

                state.state.configure_output(data.output, width, height);
            }
            zwlr_layer_surface_v1::Event::Closed => {
                warn!("Layer surface of {} closed by the compositor", data.output);
                state.remove_output(data.output);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, SharedState> for Wayland {
    fn event(
        _state: &mut Self,
        _buffer: &WlBuffer,
        event: wl_buffer::Event,
        data: &SharedState,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            data.set(BufferState::Free);
        }
    }
}

delegate_noop!(Wayland: ignore WlCompositor);
delegate_noop!(Wayland: ignore WlShm);
delegate_noop!(Wayland: ignore WlShmPool);
delegate_noop!(Wayland: ignore WlSurface);
delegate_noop!(Wayland: WlRegion);
delegate_noop!(Wayland: ZwlrLayerShellV1);
delegate_noop!(Wayland: ZxdgOutputManagerV1);
