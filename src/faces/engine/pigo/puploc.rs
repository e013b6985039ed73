//! Pupil and facial landmark localization cascades.
//!
//! A localization cascade regresses a point from a starting region: each
//! stage sums per-tree offsets, moves the region and shrinks it. The result
//! is the median over randomly perturbed starting regions.

use anyhow::Result;
use rand::Rng;

use super::cascade::{GrayImage, PacketReader};
use crate::error::FacesError;

/// A localization region. `scale` is the region side length in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Puploc {
    pub row: i32,
    pub col: i32,
    pub scale: f32,
    pub perturbs: usize,
}

pub struct PuplocCascade {
    stages: u32,
    scales: f32,
    trees: u32,
    tree_depth: u32,
    tree_codes: Vec<i8>,
    tree_preds: Vec<f32>,
}

impl PuplocCascade {
    pub fn unpack(name: &str, packet: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(name, packet);

        let stages = reader.u32()?;
        let scales = reader.f32()?;
        let trees = reader.u32()?;
        let tree_depth = reader.u32()?;

        if tree_depth == 0 || tree_depth > 16 {
            return Err(FacesError::InvalidCascade {
                name: name.to_string(),
                reason: format!("unsupported tree depth {}", tree_depth),
            }
            .into());
        }

        let leaves = 1usize << tree_depth;
        // Codes plus a (row, col) offset pair per leaf.
        let tree_bytes = (4 * leaves - 4) + 8 * leaves;
        let total = reader.expect_records(stages as u64 * trees as u64, tree_bytes as u64)?;
        let mut tree_codes = Vec::with_capacity(total * (4 * leaves - 4));
        let mut tree_preds = Vec::with_capacity(total * 2 * leaves);

        for _ in 0..total {
            tree_codes.extend(reader.codes(4 * leaves - 4)?);
            for _ in 0..2 * leaves {
                tree_preds.push(reader.f32()?);
            }
        }

        Ok(Self {
            stages,
            scales,
            trees,
            tree_depth,
            tree_codes,
            tree_preds,
        })
    }

    fn classify_region(
        &self,
        row: f32,
        col: f32,
        scale: f32,
        img: &GrayImage,
        flip: bool,
    ) -> (f32, f32, f32) {
        let leaves = 1usize << self.tree_depth;
        let (mut r, mut c, mut s) = (row, col, scale);
        let mut root = 0usize;

        for i in 0..self.stages as usize {
            let (mut dr, mut dc) = (0.0f32, 0.0f32);

            for j in 0..self.trees as usize {
                let mut idx = 0usize;
                let ri = r as i64 * 256;
                let ci = c as i64 * 256;
                let si = s.round() as i64;

                for _ in 0..self.tree_depth {
                    let code = |k: usize| self.tree_codes[root + 4 * idx + k] as i64;
                    let (c1, c2) = if flip {
                        ((ci - code(1) * si) >> 8, (ci - code(3) * si) >> 8)
                    } else {
                        ((ci + code(1) * si) >> 8, (ci + code(3) * si) >> 8)
                    };
                    let r1 = (ri + code(0) * si) >> 8;
                    let r2 = (ri + code(2) * si) >> 8;
                    idx = 2 * idx + 1 + usize::from(img.at(r1, c1) > img.at(r2, c2));
                }

                let lut = 2 * (self.trees as usize * leaves * i + leaves * j + idx - (leaves - 1));
                dr += self.tree_preds[lut];
                dc += if flip {
                    -self.tree_preds[lut + 1]
                } else {
                    self.tree_preds[lut + 1]
                };
                root += 4 * leaves - 4;
            }

            r += dr * s;
            c += dc * s;
            s *= self.scales;
        }

        (r, c, s)
    }

    /// Localize a point starting from `start`. Returns `None` when the
    /// result falls outside the image.
    pub fn run<R: Rng>(
        &self,
        start: &Puploc,
        img: &GrayImage,
        flip: bool,
        rng: &mut R,
    ) -> Option<Puploc> {
        let runs = start.perturbs.max(1);
        let mut rows = Vec::with_capacity(runs);
        let mut cols = Vec::with_capacity(runs);
        let mut scales = Vec::with_capacity(runs);

        for _ in 0..runs {
            let (row, col, scale) = if start.perturbs == 0 {
                (start.row as f32, start.col as f32, start.scale)
            } else {
                (
                    start.row as f32 + start.scale * 0.15 * (0.5 - rng.gen::<f32>()),
                    start.col as f32 + start.scale * 0.15 * (0.5 - rng.gen::<f32>()),
                    start.scale * (0.925 + 0.15 * rng.gen::<f32>()),
                )
            };

            let (r, c, s) = self.classify_region(row, col, scale, img, flip);
            rows.push(r);
            cols.push(c);
            scales.push(s);
        }

        let row = median(&mut rows);
        let col = median(&mut cols);
        let scale = median(&mut scales);

        let inside = row >= 0.0
            && col >= 0.0
            && (row as usize) < img.rows
            && (col as usize) < img.cols;
        if !inside || !scale.is_finite() {
            return None;
        }

        Some(Puploc {
            row: row.round() as i32,
            col: col.round() as i32,
            scale,
            perturbs: start.perturbs,
        })
    }

    /// Localize a facial landmark relative to both pupils. `flip` mirrors
    /// the cascade for the symmetric counterpart.
    pub fn landmark<R: Rng>(
        &self,
        left: &Puploc,
        right: &Puploc,
        img: &GrayImage,
        perturbs: usize,
        flip: bool,
        rng: &mut R,
    ) -> Option<Puploc> {
        let dr = (left.row - right.row) as f32;
        let dc = (left.col - right.col) as f32;
        let dist = (dr * dr + dc * dc).sqrt();

        let row = (left.row + right.row) as f32 / 2.0 + 0.25 * dist;
        let col_offset = if flip { -0.15 * dist } else { 0.15 * dist };
        let col = (left.col + right.col) as f32 / 2.0 + col_offset;

        let start = Puploc {
            row: row as i32,
            col: col as i32,
            scale: 3.0 * dist,
            perturbs,
        };

        self.run(&start, img, flip, rng)
    }
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// One stage, one depth-1 tree whose leaves both shift the point by
    /// (`dr`, `dc`) region scales.
    pub(crate) fn shifting_cascade(dr: f32, dc: f32) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.extend_from_slice(&1.0f32.to_le_bytes());
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0]);
        for _ in 0..2 {
            packet.extend_from_slice(&dr.to_le_bytes());
            packet.extend_from_slice(&dc.to_le_bytes());
        }
        packet
    }

    fn flat_image() -> GrayImage {
        GrayImage {
            pixels: vec![100; 200 * 200],
            rows: 200,
            cols: 200,
        }
    }

    #[test]
    fn test_unpack_rejects_oversized_header() {
        let mut packet = shifting_cascade(0.0, 0.0);
        packet[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        packet[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = PuplocCascade::unpack("puploc", &packet).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::InvalidCascade { .. })
        ));
    }

    #[test]
    fn test_run_applies_offsets() {
        let cascade = PuplocCascade::unpack("puploc", &shifting_cascade(0.1, -0.2)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let start = Puploc { row: 100, col: 100, scale: 50.0, perturbs: 0 };

        let p = cascade.run(&start, &flat_image(), false, &mut rng).unwrap();
        assert_eq!(p.row, 105);
        assert_eq!(p.col, 90);

        let mirrored = cascade.run(&start, &flat_image(), true, &mut rng).unwrap();
        assert_eq!(mirrored.col, 110);
    }

    #[test]
    fn test_run_with_perturbations_stays_near() {
        let cascade = PuplocCascade::unpack("puploc", &shifting_cascade(0.0, 0.0)).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let start = Puploc { row: 100, col: 100, scale: 40.0, perturbs: 31 };

        let p = cascade.run(&start, &flat_image(), false, &mut rng).unwrap();
        assert!((p.row - 100).abs() <= 3);
        assert!((p.col - 100).abs() <= 3);
    }

    #[test]
    fn test_run_outside_image_is_none() {
        let cascade = PuplocCascade::unpack("puploc", &shifting_cascade(10.0, 0.0)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let start = Puploc { row: 100, col: 100, scale: 50.0, perturbs: 0 };
        assert!(cascade.run(&start, &flat_image(), false, &mut rng).is_none());
    }

    #[test]
    fn test_landmark_starts_below_eyes() {
        let cascade = PuplocCascade::unpack("lp93", &shifting_cascade(0.0, 0.0)).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let left = Puploc { row: 80, col: 80, scale: 10.0, perturbs: 0 };
        let right = Puploc { row: 80, col: 120, scale: 10.0, perturbs: 0 };

        let p = cascade.landmark(&left, &right, &flat_image(), 0, false, &mut rng).unwrap();
        assert_eq!(p.row, 90);
        assert_eq!(p.col, 106);
        assert!((p.scale - 120.0).abs() < 1e-3);
    }

    #[test]
    fn test_unpack_truncated() {
        let packet = shifting_cascade(0.0, 0.0);
        assert!(PuplocCascade::unpack("puploc", &packet[..10]).is_err());
    }
}
