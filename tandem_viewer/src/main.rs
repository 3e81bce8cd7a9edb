#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_crate_dependencies)]

mod demo;
mod window;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use glam::UVec2;
use tandem_render::backend::BackendKind;
use tandem_render::config::{AdapterPreference, BackendSelection};
use tandem_render::window::HeadlessWindow;
use tandem_render::{AnyRenderer, RendererConfig};
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::WindowBuilder;

use demo::Demo;
use window::ViewerWindow;

const DEFAULT_SIZE: UVec2 = UVec2::new(1280, 720);

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Graphics backend: vulkan, dx12 or null.
    #[arg(short, long)]
    backend: Option<BackendKind>,
    /// Adapter index or a substring of the adapter name.
    #[arg(short, long)]
    adapter: Option<String>,
    /// Print the adapters of the backend and exit.
    #[arg(long)]
    list_adapters: bool,
    /// Wavefront OBJ file to display instead of a cube.
    #[arg(long)]
    mesh: Option<PathBuf>,
    /// Image applied to the mesh.
    #[arg(long)]
    texture: Option<PathBuf>,
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    #[arg(long)]
    no_vsync: bool,
    #[arg(long)]
    wireframe: bool,
    /// Enable API validation layers.
    #[arg(long)]
    validation: bool,
    /// Recompile shaders when their sources change.
    #[arg(long)]
    hot_reload: bool,
    /// Exit after rendering this many frames.
    #[arg(long)]
    frames: Option<u64>,
}

impl Args {
    fn config(&self) -> Result<RendererConfig, ViewerError> {
        let mut config = RendererConfig {
            app_name: "tandem_viewer".to_owned(),
            ..Default::default()
        };
        config.apply_env()?;

        // Command line arguments take precedence over the environment.
        if let Some(backend) = self.backend {
            config.backend = BackendSelection::Backend(backend);
        }

        if let Some(adapter) = &self.adapter {
            config.adapter = match adapter.parse::<usize>() {
                Ok(index) => AdapterPreference::Index(index),
                Err(_) => AdapterPreference::Name(adapter.clone()),
            };
        }

        if let Some(dir) = &self.shader_dir {
            config.shader_dir = dir.clone();
        }

        config.vsync &= !self.no_vsync;
        config.wireframe |= self.wireframe;
        config.validation |= self.validation;
        config.shader_hot_reload |= self.hot_reload;

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
enum ViewerError {
    #[error(transparent)]
    Config(#[from] tandem_render::config::ConfigError),
    #[error(transparent)]
    Render(#[from] tandem_render::Error),
    #[error(transparent)]
    EventLoop(#[from] winit::error::EventLoopError),
    #[error(transparent)]
    Os(#[from] winit::error::OsError),
}

fn main() -> ExitCode {
    tandem_tracing::init(tandem_tracing::DEFAULT_FILTER);

    let args = Args::parse();

    let res = args.config().and_then(|config| {
        if config.backend.resolve() == BackendKind::Null {
            run_headless(config, &args)
        } else {
            run_windowed(config, &args)
        }
    });

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_headless(config: RendererConfig, args: &Args) -> Result<(), ViewerError> {
    let window = Arc::new(HeadlessWindow::new(DEFAULT_SIZE));
    let mut renderer = AnyRenderer::new(config, window)?;

    if args.list_adapters {
        return list_adapters(&mut renderer);
    }

    // Without a window nothing else ends the loop.
    let mut demo = Demo::new(&mut renderer, args, Some(args.frames.unwrap_or(1)))?;
    while !demo.is_done() {
        demo.frame(&mut renderer, DEFAULT_SIZE)?;
    }

    renderer.shutdown()?;
    Ok(())
}

fn run_windowed(config: RendererConfig, args: &Args) -> Result<(), ViewerError> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let window = Arc::new(
        WindowBuilder::new()
            .with_title("tandem")
            .with_inner_size(PhysicalSize::new(DEFAULT_SIZE.x, DEFAULT_SIZE.y))
            .build(&event_loop)?,
    );

    let mut renderer = AnyRenderer::new(config, Arc::new(ViewerWindow::new(window.clone())))?;

    if args.list_adapters {
        return list_adapters(&mut renderer);
    }

    let mut demo = Demo::new(&mut renderer, args, args.frames)?;
    let mut result = Ok(());

    event_loop.run(|event, target| match event {
        Event::WindowEvent { event, .. } => match event {
            WindowEvent::CloseRequested => target.exit(),
            WindowEvent::RedrawRequested => {
                let size = window.inner_size();
                if let Err(err) = demo.frame(&mut renderer, UVec2::new(size.width, size.height)) {
                    result = Err(err);
                    target.exit();
                } else if demo.is_done() {
                    target.exit();
                }
            }
            _ => (),
        },
        Event::AboutToWait => window.request_redraw(),
        _ => (),
    })?;

    renderer.shutdown()?;
    result
}

fn list_adapters(renderer: &mut AnyRenderer) -> Result<(), ViewerError> {
    println!("{} adapters:", renderer.backend());
    for entry in renderer.adapters()? {
        println!(
            "  [{}] {} ({:?}, {:04x}:{:04x}){}",
            entry.index,
            entry.info.name,
            entry.info.kind,
            entry.info.vendor_id,
            entry.info.device_id,
            if entry.is_suitable() {
                ""
            } else {
                " unsupported"
            },
        );
    }

    renderer.shutdown()?;
    Ok(())
}
