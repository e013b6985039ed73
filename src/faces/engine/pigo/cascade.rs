//! Pixel intensity comparison cascade (face finder).
//!
//! Each tree node compares two pixels addressed relative to the region
//! center in 1/256ths of the region scale.

use anyhow::Result;

use crate::error::FacesError;

/// Cosine of the fractional rotation `i / 32`, scaled by 256.
const QCOS: [i64; 33] = [
    256, 251, 236, 212, 181, 142, 97, 49, 0, -49, -97, -142, -181, -212, -236, -251, -256, -251,
    -236, -212, -181, -142, -97, -49, 0, 49, 97, 142, 181, 212, 236, 251, 256,
];

/// Sine of the fractional rotation `i / 32`, scaled by 256.
const QSIN: [i64; 33] = [
    0, 49, 97, 142, 181, 212, 236, 251, 256, 251, 236, 212, 181, 142, 97, 49, 0, -49, -97, -142,
    -181, -212, -236, -251, -256, -251, -236, -212, -181, -142, -97, -49, 0,
];

/// Little-endian reader over a cascade file with bounds checks.
pub(crate) struct PacketReader<'a> {
    name: &'a str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub(crate) fn new(name: &'a str, buf: &'a [u8]) -> Self {
        Self { name, buf, pos: 0 }
    }

    fn truncated(&self) -> FacesError {
        FacesError::InvalidCascade {
            name: self.name.to_string(),
            reason: format!("truncated at byte {}", self.pos),
        }
    }

    /// Check that `count` records of `size` bytes fit in what is left of
    /// the packet, so header counts can size allocations.
    pub(crate) fn expect_records(&self, count: u64, size: u64) -> Result<usize, FacesError> {
        let remaining = (self.buf.len() - self.pos) as u64;
        match count.checked_mul(size) {
            Some(needed) if needed <= remaining => Ok(count as usize),
            _ => Err(FacesError::InvalidCascade {
                name: self.name.to_string(),
                reason: format!("header declares {} trees but only {} bytes follow", count, remaining),
            }),
        }
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), FacesError> {
        if self.pos + n > self.buf.len() {
            return Err(self.truncated());
        }
        self.pos += n;
        Ok(())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], FacesError> {
        let buf = self.buf;
        let end = self.pos.checked_add(n).ok_or_else(|| self.truncated())?;
        let slice = buf.get(self.pos..end).ok_or_else(|| self.truncated())?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, FacesError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, FacesError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub(crate) fn codes(&mut self, n: usize) -> Result<impl Iterator<Item = i8> + 'a, FacesError> {
        Ok(self.bytes(n)?.iter().map(|&b| b as i8))
    }
}

/// Grayscale pixels in row-major order.
pub struct GrayImage {
    pub pixels: Vec<u8>,
    pub rows: usize,
    pub cols: usize,
}

impl GrayImage {
    pub fn from_luma(img: &image::GrayImage) -> Self {
        Self {
            rows: img.height() as usize,
            cols: img.width() as usize,
            pixels: img.as_raw().clone(),
        }
    }

    #[inline]
    pub(crate) fn at(&self, row: i64, col: i64) -> u8 {
        let r = row.clamp(0, self.rows as i64 - 1) as usize;
        let c = col.clamp(0, self.cols as i64 - 1) as usize;
        self.pixels[r * self.cols + c]
    }
}

/// A raw cascade hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub row: i32,
    pub col: i32,
    pub scale: i32,
    pub q: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct CascadeParams {
    pub min_size: u32,
    pub max_size: u32,
    pub shift_factor: f64,
    pub scale_factor: f64,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            min_size: 20,
            max_size: 1000,
            shift_factor: 0.1,
            scale_factor: 1.1,
        }
    }
}

pub struct Cascade {
    tree_depth: u32,
    tree_num: u32,
    tree_codes: Vec<i8>,
    tree_preds: Vec<f32>,
    tree_thresholds: Vec<f32>,
}

impl Cascade {
    /// Parse a binary face finder cascade.
    pub fn unpack(name: &str, packet: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(name, packet);

        reader.skip(8)?;
        let tree_depth = reader.u32()?;
        let tree_num = reader.u32()?;

        if tree_depth == 0 || tree_depth > 16 {
            return Err(FacesError::InvalidCascade {
                name: name.to_string(),
                reason: format!("unsupported tree depth {}", tree_depth),
            }
            .into());
        }
        if tree_num == 0 {
            return Err(FacesError::InvalidCascade {
                name: name.to_string(),
                reason: "no trees".to_string(),
            }
            .into());
        }

        let leaves = 1usize << tree_depth;
        // Codes, one prediction per leaf and a threshold.
        let tree_bytes = (4 * leaves - 4) + 4 * leaves + 4;
        let trees = reader.expect_records(tree_num as u64, tree_bytes as u64)?;

        let mut tree_codes = Vec::with_capacity(trees * 4 * leaves);
        let mut tree_preds = Vec::with_capacity(trees * leaves);
        let mut tree_thresholds = Vec::with_capacity(trees);

        for _ in 0..tree_num {
            // Node indices start at 1; slot 0 is padding.
            tree_codes.extend_from_slice(&[0, 0, 0, 0]);
            tree_codes.extend(reader.codes(4 * leaves - 4)?);

            for _ in 0..leaves {
                tree_preds.push(reader.f32()?);
            }
            tree_thresholds.push(reader.f32()?);
        }

        Ok(Self {
            tree_depth,
            tree_num,
            tree_codes,
            tree_preds,
            tree_thresholds,
        })
    }

    fn classify_region(&self, row: i32, col: i32, scale: i32, img: &GrayImage) -> f32 {
        let leaves = 1usize << self.tree_depth;
        let r = row as i64 * 256;
        let c = col as i64 * 256;
        let s = scale as i64;
        let mut root = 0usize;
        let mut out = 0.0f32;

        for i in 0..self.tree_num as usize {
            let mut idx = 1usize;
            for _ in 0..self.tree_depth {
                let code = |k: usize| self.tree_codes[root + 4 * idx + k] as i64;
                let p1 = img.at((r + code(0) * s) >> 8, (c + code(1) * s) >> 8);
                let p2 = img.at((r + code(2) * s) >> 8, (c + code(3) * s) >> 8);
                idx = 2 * idx + usize::from(p1 <= p2);
            }

            out += self.tree_preds[leaves * i + idx - leaves];
            if out <= self.tree_thresholds[i] {
                return -1.0;
            }
            root += 4 * leaves;
        }

        out - self.tree_thresholds[self.tree_num as usize - 1]
    }

    /// `angle` is a fraction of a full turn in `(0, 1]`.
    fn classify_rotated_region(
        &self,
        row: i32,
        col: i32,
        scale: i32,
        angle: f64,
        img: &GrayImage,
    ) -> f32 {
        let leaves = 1usize << self.tree_depth;
        let slot = ((32.0 * angle) as usize).min(32);
        let qcos = QCOS[slot];
        let qsin = QSIN[slot];
        let r = row as i64 * 65536;
        let c = col as i64 * 65536;
        let s = scale as i64;
        let mut root = 0usize;
        let mut out = 0.0f32;

        for i in 0..self.tree_num as usize {
            let mut idx = 1usize;
            for _ in 0..self.tree_depth {
                let code = |k: usize| self.tree_codes[root + 4 * idx + k] as i64;
                let r1 = (r + qcos * code(0) * s - qsin * code(1) * s) >> 16;
                let c1 = (c + qsin * code(0) * s + qcos * code(1) * s) >> 16;
                let r2 = (r + qcos * code(2) * s - qsin * code(3) * s) >> 16;
                let c2 = (c + qsin * code(2) * s + qcos * code(3) * s) >> 16;
                idx = 2 * idx + usize::from(img.at(r1, c1) <= img.at(r2, c2));
            }

            out += self.tree_preds[leaves * i + idx - leaves];
            if out <= self.tree_thresholds[i] {
                return -1.0;
            }
            root += 4 * leaves;
        }

        out - self.tree_thresholds[self.tree_num as usize - 1]
    }

    /// Slide the classifier over `img` at every scale from `min_size` to
    /// `max_size`. `angle` is a fraction of a full turn; 0 disables rotation.
    pub fn run(&self, params: &CascadeParams, img: &GrayImage, angle: f64) -> Vec<Detection> {
        let mut detections = Vec::new();
        if self.tree_num == 0 {
            return detections;
        }

        let mut scale = params.min_size as f64;
        while scale <= params.max_size as f64 {
            let step = (params.shift_factor * scale).max(1.0) as usize;
            let offset = (scale / 2.0 + 1.0) as usize;
            let s = scale as i32;

            if img.rows > offset && img.cols > offset {
                for row in (offset..=img.rows - offset).step_by(step) {
                    for col in (offset..=img.cols - offset).step_by(step) {
                        let q = if angle > 0.0 {
                            self.classify_rotated_region(row as i32, col as i32, s, angle, img)
                        } else {
                            self.classify_region(row as i32, col as i32, s, img)
                        };

                        if q > 0.0 {
                            detections.push(Detection {
                                row: row as i32,
                                col: col as i32,
                                scale: s,
                                q,
                            });
                        }
                    }
                }
            }

            scale *= params.scale_factor;
        }

        detections
    }
}

fn iou(a: &Detection, b: &Detection) -> f64 {
    let (r1, c1, s1) = (a.row as f64, a.col as f64, a.scale as f64);
    let (r2, c2, s2) = (b.row as f64, b.col as f64, b.scale as f64);

    let over_row = ((r1 + s1 / 2.0).min(r2 + s2 / 2.0) - (r1 - s1 / 2.0).max(r2 - s2 / 2.0)).max(0.0);
    let over_col = ((c1 + s1 / 2.0).min(c2 + s2 / 2.0) - (c1 - s1 / 2.0).max(c2 - s2 / 2.0)).max(0.0);
    let inter = over_row * over_col;

    inter / (s1 * s1 + s2 * s2 - inter)
}

/// Merge detections whose IoU with a seed exceeds `threshold`, averaging
/// position and scale and summing scores.
pub fn cluster_detections(detections: &[Detection], threshold: f64) -> Vec<Detection> {
    let mut assigned = vec![false; detections.len()];
    let mut clusters = Vec::new();

    for i in 0..detections.len() {
        if assigned[i] {
            continue;
        }

        let (mut r, mut c, mut s, mut n) = (0i64, 0i64, 0i64, 0i64);
        let mut q = 0.0f32;

        for j in i..detections.len() {
            if iou(&detections[i], &detections[j]) > threshold {
                assigned[j] = true;
                r += detections[j].row as i64;
                c += detections[j].col as i64;
                s += detections[j].scale as i64;
                q += detections[j].q;
                n += 1;
            }
        }

        if n > 0 {
            clusters.push(Detection {
                row: (r / n) as i32,
                col: (c / n) as i32,
                scale: (s / n) as i32,
                q,
            });
        }
    }

    clusters
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One depth-1 tree comparing the region center with itself, which
    /// always takes the right branch.
    pub(crate) fn constant_cascade(pred: f32, threshold: f32) -> Vec<u8> {
        let mut packet = vec![0u8; 8];
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0]);
        packet.extend_from_slice(&0.0f32.to_le_bytes());
        packet.extend_from_slice(&pred.to_le_bytes());
        packet.extend_from_slice(&threshold.to_le_bytes());
        packet
    }

    fn flat_image(rows: usize, cols: usize) -> GrayImage {
        GrayImage {
            pixels: vec![128; rows * cols],
            rows,
            cols,
        }
    }

    #[test]
    fn test_unpack_rejects_truncated_packet() {
        let packet = constant_cascade(1.0, 0.0);
        let err = Cascade::unpack("facefinder", &packet[..packet.len() - 2]).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::InvalidCascade { .. })
        ));
    }

    #[test]
    fn test_unpack_rejects_oversized_header() {
        let mut packet = constant_cascade(1.0, 0.0);
        packet[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = Cascade::unpack("facefinder", &packet).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::InvalidCascade { .. })
        ));

        packet[12..16].copy_from_slice(&0u32.to_le_bytes());
        assert!(Cascade::unpack("facefinder", &packet).is_err());
    }

    #[test]
    fn test_run_finds_regions_when_score_passes() {
        let cascade = Cascade::unpack("facefinder", &constant_cascade(2.0, 0.5)).unwrap();
        let params = CascadeParams {
            min_size: 20,
            max_size: 20,
            ..Default::default()
        };

        let dets = cascade.run(&params, &flat_image(40, 40), 0.0);
        assert!(!dets.is_empty());
        assert!(dets.iter().all(|d| d.scale == 20 && (d.q - 1.5).abs() < 1e-6));

        let rotated = cascade.run(&params, &flat_image(40, 40), 0.05);
        assert_eq!(rotated.len(), dets.len());
    }

    #[test]
    fn test_run_rejects_when_below_threshold() {
        let cascade = Cascade::unpack("facefinder", &constant_cascade(0.5, 1.0)).unwrap();
        let dets = cascade.run(&CascadeParams::default(), &flat_image(64, 64), 0.0);
        assert!(dets.is_empty());
    }

    #[test]
    fn test_cluster_detections_merges_overlaps() {
        let dets = vec![
            Detection { row: 50, col: 50, scale: 40, q: 3.0 },
            Detection { row: 52, col: 51, scale: 40, q: 2.0 },
            Detection { row: 200, col: 200, scale: 40, q: 1.0 },
        ];

        let clusters = cluster_detections(&dets, 0.41);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].row, 51);
        assert_eq!(clusters[0].col, 50);
        assert!((clusters[0].q - 5.0).abs() < 1e-6);
        assert!((clusters[1].q - 1.0).abs() < 1e-6);
    }
}
