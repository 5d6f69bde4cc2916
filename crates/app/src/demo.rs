//! Demo content cooked on the fly when no asset directory is given.

use std::path::Path;

use anyhow::{Context, Result};
use glam::Vec3;
use tracing::info;

use renderer_assets::{
    MaterialInfo, TextureFormat, TransparencyMode, VertexPncvF32, generate_mip_chain,
    pack_material, pack_texture, pack_vertices,
};
use renderer_rhi::shader::{SPIRV_MAGIC, ShaderCode, ShaderStage};

/// Effects every demo material refers to: (name, textured).
pub const EFFECTS: [(&str, bool); 2] = [("defaultmesh", false), ("texturedmesh", true)];

const CHECKER_SIZE: u32 = 64;

/// Writes a cube, a checker texture and two materials into `dir`.
pub fn cook(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let (vertices, indices) = cube();
    pack_vertices(&vertices, &indices, "cube.obj")?.save(&dir.join("cube.msh"))?;

    let rgba = checker(CHECKER_SIZE);
    let (extents, pixels) = generate_mip_chain(CHECKER_SIZE, CHECKER_SIZE, &rgba)?;
    pack_texture(TextureFormat::Rgba8, &extents, &pixels, "checker.png")?
        .save(&dir.join("checker.tex"))?;

    pack_material(&MaterialInfo::new("texturedmesh").with_texture("baseColor", "checker.tex"))?
        .save(&dir.join("checker.mat"))?;
    pack_material(
        &MaterialInfo::new("defaultmesh")
            .with_property("tint", "0.2 0.6 1.0")
            .with_transparency(TransparencyMode::Transparent),
    )?
    .save(&dir.join("glass.mat"))?;

    info!("Cooked demo assets into {}", dir.display());
    Ok(())
}

/// Shader code for an effect.
///
/// Reads `<dir>/shaders/<effect>.vert.spv` and `.frag.spv` when present.
/// The headless backend never executes shaders, so a bare SPIR-V header
/// stands in for missing files.
pub fn shader(dir: &Path, effect: &str, stage: ShaderStage) -> Result<ShaderCode> {
    let extension = match stage {
        ShaderStage::Vertex => "vert",
        _ => "frag",
    };
    let path = dir
        .join("shaders")
        .join(format!("{}.{}.spv", effect, extension));

    if path.exists() {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(ShaderCode::from_spirv_bytes(&bytes, stage, "main")?);
    }
    Ok(ShaderCode::from_words(
        vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0],
        stage,
        "main",
    )?)
}

fn cube() -> (Vec<VertexPncvF32>, Vec<u32>) {
    let faces = [
        (Vec3::X, Vec3::Y),
        (Vec3::NEG_X, Vec3::Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y),
    ];
    let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up) in faces {
        let right = up.cross(normal);
        let base = vertices.len() as u32;
        let corners = [
            normal - right - up,
            normal + right - up,
            normal + right + up,
            normal - right + up,
        ];
        for (corner, uv) in corners.into_iter().zip(uvs) {
            vertices.push(VertexPncvF32::new(corner, normal, normal.abs(), uv));
        }
        indices.extend([base, base + 1, base + 2, base + 2, base + 3, base]);
    }
    (vertices, indices)
}

fn checker(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x / 8 + y / 8) % 2 == 0 {
                [230, 230, 230, 255]
            } else {
                [40, 40, 40, 255]
            }
        })
        .collect()
}
