//! Binary layouts exchanged with the tracer workers.
//!
//! Task payloads are built from a [`Job`] and a [`Tile`]; result
//! artifacts are decoded into [`TracerResult`]. Both are little-endian.

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::types::{Job, Tile};

/// Size of the fixed result header: six little-endian `u32` fields.
pub const RESULT_HEADER_LEN: usize = 24;

/// Surface behaviour of a sphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reflection {
    Diffuse,
    Specular,
    Refractive,
}

impl Reflection {
    pub fn as_u32(&self) -> u32 {
        match self {
            Reflection::Diffuse => 0,
            Reflection::Specular => 1,
            Reflection::Refractive => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub radius: f32,
    pub position: [f32; 3],
    pub emission: [f32; 3],
    pub color: [f32; 3],
    pub reflection: Reflection,
    pub max_reflectivity: f32,
}

impl Sphere {
    pub fn new(
        radius: f32,
        position: [f32; 3],
        emission: [f32; 3],
        color: [f32; 3],
        reflection: Reflection,
    ) -> Self {
        Self {
            radius,
            position,
            emission,
            color,
            reflection,
            max_reflectivity: -1.0,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        put_f32(out, self.radius);
        for v in self.position.iter().chain(&self.emission).chain(&self.color) {
            put_f32(out, *v);
        }
        put_u32(out, self.reflection.as_u32());
        put_f32(out, self.max_reflectivity);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub length: f32,
    pub cst: f32,
    pub position: [f32; 3],
    pub direction: [f32; 3],
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            length: 140.0,
            cst: 0.4635,
            position: [50.0, 52.0, 295.6],
            direction: [0.0, -0.072612, -1.0],
        }
    }
}

impl Camera {
    fn write_to(&self, out: &mut Vec<u8>) {
        put_f32(out, self.length);
        put_f32(out, self.cst);
        for v in self.position.iter().chain(&self.direction) {
            put_f32(out, *v);
        }
    }
}

/// Camera and geometry shipped with every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub camera: Camera,
    pub spheres: Vec<Sphere>,
}

impl Default for Scene {
    /// Box room with mirror, glass and coloured diffuse spheres under an area light.
    fn default() -> Self {
        use Reflection::*;
        const NONE: [f32; 3] = [0.0, 0.0, 0.0];
        const WHITE: [f32; 3] = [0.999, 0.999, 0.999];
        let spheres = vec![
            Sphere::new(1e5, [1e5 - 5.0, 40.8, 81.6], NONE, [0.75, 0.25, 0.25], Diffuse),
            Sphere::new(1e5, [-1e5 + 104.0, 40.8, 81.6], NONE, [0.25, 0.25, 0.75], Diffuse),
            Sphere::new(1e5, [50.0, 40.8, 1e5], NONE, [0.75, 0.75, 0.75], Diffuse),
            Sphere::new(1e5, [50.0, 40.8, -1e5 + 170.0], NONE, NONE, Diffuse),
            Sphere::new(1e5, [50.0, 1e5, 81.6], NONE, [0.75, 0.75, 0.75], Diffuse),
            Sphere::new(1e5, [50.0, -1e5 + 81.6, 81.6], NONE, [0.75, 0.75, 0.75], Diffuse),
            Sphere::new(16.5, [40.0, 16.5, 47.0], NONE, WHITE, Specular),
            Sphere::new(10.0, [90.0, 25.0, 125.0], NONE, WHITE, Specular),
            Sphere::new(16.5, [73.0, 46.5, 94.0], NONE, WHITE, Refractive),
            Sphere::new(10.0, [15.0, 45.0, 112.0], NONE, WHITE, Diffuse),
            Sphere::new(15.0, [16.0, 16.0, 130.0], NONE, [0.0, 0.999, 0.0], Refractive),
            Sphere::new(7.5, [40.0, 8.0, 120.0], NONE, [0.999, 0.999, 0.0], Refractive),
            Sphere::new(8.5, [67.0, 9.0, 122.0], [0.1, 0.1, 0.0], [0.999, 0.999, 0.0], Refractive),
            Sphere::new(10.0, [80.0, 12.0, 92.0], [0.1, 1.0, 0.1], [0.1, 0.6, 0.1], Diffuse),
            Sphere::new(600.0, [50.0, 681.33, 81.6], [1.5, 1.5, 1.5], NONE, Diffuse),
            Sphere::new(9.0, [95.0, 65.0, 81.6], [0.0, 0.4, 0.8], [0.1, 0.3, 0.6], Diffuse),
            Sphere::new(8.0, [15.0, 70.0, 75.0], [1.0, 0.1, 0.1], [0.6, 0.1, 0.1], Diffuse),
        ];
        Self {
            camera: Camera::default(),
            spheres,
        }
    }
}

/// Task payload for one tile of a job.
///
/// Layout: image width, image height, tile row offset, tile column offset,
/// kill depth, split depth, tile width, tile height, samples (all `u32`),
/// error threshold (`f32`), camera, then every sphere.
#[derive(Debug, Clone, Copy)]
pub struct TracerPayload<'a> {
    job: &'a Job,
    tile: &'a Tile,
}

impl<'a> TracerPayload<'a> {
    pub fn for_tile(job: &'a Job, tile: &'a Tile) -> Self {
        Self { job, tile }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (job, tile) = (self.job, self.tile);
        let mut out = Vec::with_capacity(40 + 32 + job.scene.spheres.len() * 48);
        put_u32(&mut out, job.width);
        put_u32(&mut out, job.height);
        put_u32(&mut out, tile.coord_x);
        put_u32(&mut out, tile.coord_y);
        put_u32(&mut out, job.kill_depth);
        put_u32(&mut out, job.split_depth);
        put_u32(&mut out, tile.width);
        put_u32(&mut out, tile.height);
        put_u32(&mut out, tile.samples);
        put_f32(&mut out, job.error_threshold);
        job.scene.camera.write_to(&mut out);
        for sphere in &job.scene.spheres {
            sphere.write_to(&mut out);
        }
        out
    }
}

/// One decoded pass of a tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TracerResult {
    pub coord_x: u32,
    pub coord_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Samples per pixel accumulated so far.
    pub samples: u32,
    pub is_final: bool,
    /// RGB bytes, row-major, first row at the bottom of the tile.
    pub pixels: Vec<u8>,
    /// Per-channel `f32` weights, present in overlay mode only.
    pub weights: Vec<u8>,
    /// Result to watch next; empty when `is_final`.
    pub next_result_id: String,
}

impl TracerResult {
    /// Decode a downloaded artifact. `overlay` selects whether the weight
    /// block sits between the pixels and the successor id.
    pub fn decode(bytes: &[u8], overlay: bool) -> Result<Self> {
        if bytes.len() < RESULT_HEADER_LEN {
            return Err(GridError::Decode(format!(
                "{} bytes is shorter than the {}-byte header",
                bytes.len(),
                RESULT_HEADER_LEN
            )));
        }

        let coord_x = read_u32(bytes, 0);
        let coord_y = read_u32(bytes, 4);
        let tile_width = read_u32(bytes, 8);
        let tile_height = read_u32(bytes, 12);
        let samples = read_u32(bytes, 16);
        let is_final = read_u32(bytes, 20) != 0;

        let layout = (tile_width as usize)
            .checked_mul(tile_height as usize)
            .and_then(|px| px.checked_mul(3))
            .and_then(|pixel_len| {
                let weight_len = if overlay { pixel_len.checked_mul(4)? } else { 0 };
                let pixels_end = RESULT_HEADER_LEN.checked_add(pixel_len)?;
                Some((pixels_end, pixels_end.checked_add(weight_len)?))
            });
        let Some((pixels_end, weights_end)) = layout else {
            return Err(GridError::Decode(format!(
                "{}x{} tile does not fit in memory",
                tile_width, tile_height
            )));
        };

        if bytes.len() < weights_end {
            return Err(GridError::Decode(format!(
                "{}x{} tile needs {} bytes, got {}",
                tile_width,
                tile_height,
                weights_end,
                bytes.len()
            )));
        }

        let tail = &bytes[weights_end..];
        if !tail.is_ascii() {
            return Err(GridError::Decode(
                "successor result id is not ASCII".to_string(),
            ));
        }
        let next_result_id = String::from_utf8_lossy(tail)
            .trim_end_matches('\0')
            .trim()
            .to_string();

        if !is_final && next_result_id.is_empty() {
            return Err(GridError::Decode(
                "non-final result carries no successor id".to_string(),
            ));
        }

        Ok(Self {
            coord_x,
            coord_y,
            tile_width,
            tile_height,
            samples,
            is_final,
            pixels: bytes[RESULT_HEADER_LEN..pixels_end].to_vec(),
            weights: bytes[pixels_end..weights_end].to_vec(),
            next_result_id,
        })
    }

    /// Encode back into the wire layout. Workers produce this format;
    /// the client only needs it to fabricate artifacts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            RESULT_HEADER_LEN + self.pixels.len() + self.weights.len() + self.next_result_id.len(),
        );
        put_u32(&mut out, self.coord_x);
        put_u32(&mut out, self.coord_y);
        put_u32(&mut out, self.tile_width);
        put_u32(&mut out, self.tile_height);
        put_u32(&mut out, self.samples);
        put_u32(&mut out, self.is_final as u32);
        out.extend_from_slice(&self.pixels);
        out.extend_from_slice(&self.weights);
        out.extend_from_slice(self.next_result_id.as_bytes());
        out
    }

    pub fn coords(&self) -> (u32, u32) {
        (self.coord_x, self.coord_y)
    }

    /// RGB of the pixel at tile row `row` (0 = bottom) and column `col`.
    pub fn pixel(&self, row: u32, col: u32) -> [u8; 3] {
        let i = (row as usize * self.tile_width as usize + col as usize) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// Decoded per-channel weights.
    pub fn weights_f32(&self) -> impl Iterator<Item = f32> + '_ {
        self.weights
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
