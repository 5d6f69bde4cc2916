//! Headless renderer driver.
//!
//! Loads cooked assets (or cooks a demo set), runs the frame loop against the
//! headless backend and reports any synchronization hazard it recorded. Exits
//! non-zero if a hazard was seen or a resource outlived shutdown.

mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use glam::{Mat4, Vec3};
use tracing::{error, info, warn};

use renderer_assets::VertexFormat;
use renderer_core::{Config, Timer, VarRegistry};
use renderer_renderer::{CameraUBO, FrameOutcome, MaterialId, MeshId, Renderer};
use renderer_rhi::DeviceLimits;
use renderer_rhi::headless::HeadlessBackend;
use renderer_rhi::image::Extent2D;
use renderer_rhi::shader::ShaderStage;

#[derive(Parser, Debug)]
#[command(name = "renderer-app")]
#[command(about = "Runs the frame loop headlessly and checks GPU synchronization")]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist.
    #[arg(long, env = "RENDERER_CONFIG", default_value = "renderer.toml")]
    config: PathBuf,

    /// Number of frames to render.
    #[arg(long, default_value_t = 240)]
    frames: u64,

    /// Number of objects to place in the scene.
    #[arg(long, default_value_t = 16)]
    objects: u32,

    /// Directory of cooked `.msh`/`.tex`/`.mat` files. A demo set is cooked
    /// into a temporary directory when omitted.
    #[arg(long)]
    assets: Option<PathBuf>,
}

fn main() -> Result<()> {
    renderer_core::init_logging();
    let cli = Cli::parse();
    info!("Starting headless renderer");

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let (assets, scratch) = match &cli.assets {
        Some(dir) => (dir.clone(), None),
        None => {
            let dir = std::env::temp_dir().join(format!("renderer-demo-{}", std::process::id()));
            demo::cook(&dir)?;
            (dir.clone(), Some(dir))
        }
    };

    let result = run(&cli, &config, &assets);

    if let Some(dir) = scratch
        && let Err(e) = std::fs::remove_dir_all(&dir)
    {
        warn!("Failed to remove {}: {}", dir.display(), e);
    }
    result
}

fn run(cli: &Cli, config: &Config, assets: &Path) -> Result<()> {
    let backend = Arc::new(HeadlessBackend::with_surface(
        Extent2D::from(config.renderer.extent),
        DeviceLimits::default(),
    ));
    // Per-call event history is only useful in tests
    backend.set_record_events(false);

    let mut vars = VarRegistry::new();
    let mut renderer = Renderer::new(backend.clone(), &config.renderer, &mut vars)?;
    let overridden = config.apply_vars(&mut vars)?;
    info!("{} variable(s) overridden by config", overridden);

    for (effect, textured) in demo::EFFECTS {
        let vertex = demo::shader(assets, effect, ShaderStage::Vertex)?;
        let fragment = demo::shader(assets, effect, ShaderStage::Fragment)?;
        renderer.create_effect(effect, &vertex, &fragment, VertexFormat::PncvF32, textured)?;
    }

    let (meshes, materials) = load_assets(&mut renderer, assets)?;
    populate(&mut renderer, &meshes, &materials, cli.objects);

    let timer = Timer::new();
    for frame in 0..cli.frames {
        let angle = frame as f32 * 0.01;
        let eye = Vec3::new(angle.sin() * 30.0, 12.0, angle.cos() * 30.0);
        let aspect = renderer.swapchain_extent().aspect_ratio();
        renderer.set_camera(CameraUBO::look_at(eye, Vec3::ZERO, aspect));

        match renderer.draw_frame(&vars) {
            Ok(FrameOutcome::Rendered(_) | FrameOutcome::Skipped) => {}
            Err(e) if e.is_fatal() => {
                error!("Fatal error on frame {}: {}", frame, e);
                break;
            }
            Err(e) => warn!("Frame {} failed: {}", frame, e),
        }
    }
    let elapsed = timer.elapsed();

    let stats = *renderer.stats();
    renderer.shutdown()?;

    info!(
        "{} frames rendered, {} skipped, {} draws in {:.1} ms",
        stats.frames_rendered,
        stats.frames_skipped,
        stats.total_draws,
        elapsed.as_secs_f64() * 1000.0
    );

    let hazards = backend.take_hazards();
    for hazard in &hazards {
        error!("Hazard: {}", hazard);
    }
    let leaked = backend.live_resource_count();
    if !hazards.is_empty() || leaked > 0 {
        bail!(
            "{} hazard(s) recorded, {} resource(s) alive after shutdown",
            hazards.len(),
            leaked
        );
    }
    info!("No hazards recorded");
    Ok(())
}

/// Loads every mesh and material in `dir`. A file that fails to load is
/// logged and skipped.
fn load_assets(renderer: &mut Renderer, dir: &Path) -> Result<(Vec<MeshId>, Vec<MaterialId>)> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read asset directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    let mut meshes = Vec::new();
    let mut materials = Vec::new();
    for path in &paths {
        match path.extension().and_then(|e| e.to_str()) {
            Some(renderer_assets::MESH_EXTENSION) => match renderer.load_mesh(path) {
                Ok(id) => meshes.push(id),
                Err(e) => warn!("Skipping mesh {}: {}", path.display(), e),
            },
            Some(renderer_assets::MATERIAL_EXTENSION) => {
                match renderer.load_material(path) {
                    Ok(id) => materials.push(id),
                    Err(e) => warn!("Skipping material {}: {}", path.display(), e),
                }
            }
            _ => {}
        }
    }

    if meshes.is_empty() || materials.is_empty() {
        bail!(
            "{} holds {} usable mesh(es) and {} material(s), need at least one of each",
            dir.display(),
            meshes.len(),
            materials.len()
        );
    }
    info!(
        "Loaded {} mesh(es) and {} material(s) from {}",
        meshes.len(),
        materials.len(),
        dir.display()
    );
    Ok((meshes, materials))
}

/// Lays `count` objects out on a square grid, cycling through meshes and
/// materials.
fn populate(renderer: &mut Renderer, meshes: &[MeshId], materials: &[MaterialId], count: u32) {
    let side = (count as f32).sqrt().ceil().max(1.0) as u32;
    for i in 0..count {
        let (x, z) = ((i % side) as f32, (i / side) as f32);
        let offset = (side as f32 - 1.0) * 1.5;
        let transform = Mat4::from_translation(Vec3::new(x * 3.0 - offset, 0.0, z * 3.0 - offset));

        let mesh = meshes[i as usize % meshes.len()];
        let material = materials[i as usize % materials.len()];
        if let Err(e) = renderer.add_object(mesh, material, transform) {
            warn!("Object {} not added: {}", i, e);
        }
    }
    info!("Scene has {} object(s)", renderer.objects().len());
}
