//! Crtc transforms: 16.16 fixed matrices from clients, float matrices for
//! geometry, and resampling filters.

use crate::error::{RrError, RrResult};
use crate::types::{Bounds, Rotation};
use glam::{DMat3, DVec3};

const FIXED_ONE: i32 = 1 << 16;

/// 3x3 matrix of 16.16 fixed point values, row major
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedMatrix(pub [[i32; 3]; 3]);

impl FixedMatrix {
    pub const IDENTITY: FixedMatrix = FixedMatrix([
        [FIXED_ONE, 0, 0],
        [0, FIXED_ONE, 0],
        [0, 0, FIXED_ONE],
    ]);

    pub fn translate(x: i32, y: i32) -> Self {
        FixedMatrix([
            [FIXED_ONE, 0, x << 16],
            [0, FIXED_ONE, y << 16],
            [0, 0, FIXED_ONE],
        ])
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn to_dmat3(&self) -> DMat3 {
        let m = self.0;
        let f = |v: i32| v as f64 / FIXED_ONE as f64;
        from_rows([
            [f(m[0][0]), f(m[0][1]), f(m[0][2])],
            [f(m[1][0]), f(m[1][1]), f(m[1][2])],
            [f(m[2][0]), f(m[2][1]), f(m[2][2])],
        ])
    }

    pub fn from_dmat3(m: &DMat3) -> Self {
        let rows = to_rows(m);
        let mut out = [[0i32; 3]; 3];
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                out[r][c] = (v * FIXED_ONE as f64).round() as i32;
            }
        }
        FixedMatrix(out)
    }

    /// Flattened row by row, as on the wire
    pub fn to_array(&self) -> [i32; 9] {
        let m = self.0;
        [
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        ]
    }

    pub fn from_array(v: [i32; 9]) -> Self {
        FixedMatrix([[v[0], v[1], v[2]], [v[3], v[4], v[5]], [v[6], v[7], v[8]]])
    }
}

impl Default for FixedMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn from_rows(r: [[f64; 3]; 3]) -> DMat3 {
    DMat3::from_cols_array_2d(&r).transpose()
}

fn to_rows(m: &DMat3) -> [[f64; 3]; 3] {
    m.transpose().to_cols_array_2d()
}

fn fixed_is_integral(v: i32) -> bool {
    v & (FIXED_ONE - 1) == 0
}

/// Resampling filters known to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Bilinear,
    Convolution,
    SeparableConvolution,
}

impl Filter {
    /// Resolve a filter name, including the `fast`/`good`/`best` aliases
    pub fn lookup(name: &[u8]) -> Option<Filter> {
        match name {
            b"nearest" | b"fast" => Some(Filter::Nearest),
            b"bilinear" | b"good" | b"best" => Some(Filter::Bilinear),
            b"convolution" => Some(Filter::Convolution),
            b"separable-convolution" => Some(Filter::SeparableConvolution),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::Nearest => "nearest",
            Filter::Bilinear => "bilinear",
            Filter::Convolution => "convolution",
            Filter::SeparableConvolution => "separable-convolution",
        }
    }

    /// Check the parameters, returning the kernel footprint
    pub fn validate(&self, params: &[i32]) -> Option<(i32, i32)> {
        match self {
            Filter::Nearest | Filter::Bilinear => params.is_empty().then_some((1, 1)),
            Filter::Convolution => {
                if params.len() < 3 || !fixed_is_integral(params[0]) || !fixed_is_integral(params[1]) {
                    return None;
                }
                let w = params[0] >> 16;
                let h = params[1] >> 16;
                let kernel = (params.len() - 2) as i64;
                (w >= 0 && h >= 0 && w as i64 * h as i64 <= kernel).then_some((w, h))
            }
            Filter::SeparableConvolution => {
                if params.len() < 4 || !params[..4].iter().all(|&p| fixed_is_integral(p)) {
                    return None;
                }
                let w = params[0] >> 16;
                let h = params[1] >> 16;
                let x_phase = params[2] >> 16;
                let y_phase = params[3] >> 16;
                if w <= 0 || h <= 0 || !(0..16).contains(&x_phase) || !(0..16).contains(&y_phase) {
                    return None;
                }
                let expected = 4 + ((w as i64) << x_phase) + ((h as i64) << y_phase);
                (params.len() as i64 == expected).then_some((w, h))
            }
        }
    }
}

/// A transform requested by a client, with its resampling filter
#[derive(Debug, Clone)]
pub struct ClientTransform {
    pub matrix: FixedMatrix,
    pub forward: DMat3,
    pub inverse: DMat3,
    pub filter: Option<Filter>,
    pub params: Vec<i32>,
    pub width: i32,
    pub height: i32,
}

impl ClientTransform {
    pub fn identity() -> Self {
        Self {
            matrix: FixedMatrix::IDENTITY,
            forward: DMat3::IDENTITY,
            inverse: DMat3::IDENTITY,
            filter: None,
            params: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    /// Build from a wire matrix and filter, validating like SetCrtcTransform
    pub fn from_request(matrix: FixedMatrix, filter_name: &[u8], params: &[i32]) -> RrResult<Self> {
        let forward = matrix.to_dmat3();
        if forward.determinant() == 0.0 {
            return Err(RrError::Match(0));
        }
        let (filter, (width, height)) = if filter_name.is_empty() {
            if !params.is_empty() {
                return Err(RrError::Match(0));
            }
            (None, (0, 0))
        } else {
            let filter = Filter::lookup(filter_name).ok_or(RrError::Name(0))?;
            let size = filter.validate(params).ok_or(RrError::Match(0))?;
            (Some(filter), size)
        };
        Ok(Self {
            matrix,
            forward,
            inverse: forward.inverse(),
            filter,
            params: params.to_vec(),
            width,
            height,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.matrix.is_identity()
    }
}

impl Default for ClientTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Identity transforms compare equal whatever filter they carry
impl PartialEq for ClientTransform {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_identity(), other.is_identity()) {
            (true, true) => true,
            (false, false) => {
                self.matrix == other.matrix && self.filter == other.filter && self.params == other.params
            }
            _ => false,
        }
    }
}

/// Mapping from crtc (mode) space into screen space
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTransform {
    pub matrix: FixedMatrix,
    pub forward: DMat3,
    pub inverse: DMat3,
}

impl Default for DeviceTransform {
    fn default() -> Self {
        Self {
            matrix: FixedMatrix::IDENTITY,
            forward: DMat3::IDENTITY,
            inverse: DMat3::IDENTITY,
        }
    }
}

/// Prepend `m` to the forward chain, appending its inverse to the reverse one
fn push(forward: &mut DMat3, inverse: &mut DMat3, m: DMat3, m_inv: DMat3) {
    *forward = m * *forward;
    *inverse = *inverse * m_inv;
}

fn translation(tx: f64, ty: f64) -> DMat3 {
    from_rows([[1.0, 0.0, tx], [0.0, 1.0, ty], [0.0, 0.0, 1.0]])
}

impl DeviceTransform {
    /// Compose rotation, reflection, the client transform and the crtc
    /// position for a mode of `width` x `height`.
    ///
    /// Returns the transform and whether it is anything more than a
    /// translation.
    pub fn compute(
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        rotation: Rotation,
        client: Option<&ClientTransform>,
    ) -> (DeviceTransform, bool) {
        let (w, h) = (width as f64, height as f64);
        let mut forward = DMat3::IDENTITY;
        let mut inverse = DMat3::IDENTITY;

        if rotation != Rotation::ROTATE_0 {
            let (cos, sin, dx, dy) = match rotation.angle() {
                Rotation::ROTATE_90 => (0.0, 1.0, h, 0.0),
                Rotation::ROTATE_180 => (-1.0, 0.0, w, h),
                Rotation::ROTATE_270 => (0.0, -1.0, 0.0, w),
                _ => (1.0, 0.0, 0.0, 0.0),
            };
            let rot = from_rows([[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]]);
            let rot_inv = from_rows([[cos, sin, 0.0], [-sin, cos, 0.0], [0.0, 0.0, 1.0]]);
            push(&mut forward, &mut inverse, rot, rot_inv);
            push(&mut forward, &mut inverse, translation(dx, dy), translation(-dx, -dy));

            let upright = rotation.intersects(Rotation::ROTATE_0 | Rotation::ROTATE_180);
            let (mut sx, mut sdx, mut sy, mut sdy) = (1.0, 0.0, 1.0, 0.0);
            if rotation.contains(Rotation::REFLECT_X) {
                sx = -1.0;
                sdx = if upright { w } else { h };
            }
            if rotation.contains(Rotation::REFLECT_Y) {
                sy = -1.0;
                sdy = if upright { h } else { w };
            }
            let scale = from_rows([[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, 1.0]]);
            // Reflection is its own inverse
            push(&mut forward, &mut inverse, scale, scale);
            push(&mut forward, &mut inverse, translation(sdx, sdy), translation(-sdx, -sdy));
        }

        if let Some(client) = client {
            forward = client.forward * forward;
            inverse = inverse * client.inverse;
        }

        let matrix = FixedMatrix::from_dmat3(&forward);
        if matrix.is_identity() {
            let (fx, fy) = (x as f64, y as f64);
            let device = DeviceTransform {
                matrix: FixedMatrix::translate(x, y),
                forward: translation(fx, fy),
                inverse: translation(-fx, -fy),
            };
            return (device, false);
        }

        let (fx, fy) = (x as f64, y as f64);
        push(&mut forward, &mut inverse, translation(fx, fy), translation(-fx, -fy));
        let device = DeviceTransform {
            matrix: FixedMatrix::from_dmat3(&forward),
            forward,
            inverse,
        };
        (device, true)
    }
}

fn apply(m: &DMat3, x: f64, y: f64) -> (f64, f64) {
    let v = *m * DVec3::new(x, y, 1.0);
    if v.z == 0.0 {
        (v.x, v.y)
    } else {
        (v.x / v.z, v.y / v.z)
    }
}

/// Bounding box of `b` under `m`, rounded outwards
pub fn transform_bounds(m: &DMat3, b: &Bounds) -> Bounds {
    let corners = [
        apply(m, b.x1 as f64, b.y1 as f64),
        apply(m, b.x2 as f64, b.y1 as f64),
        apply(m, b.x1 as f64, b.y2 as f64),
        apply(m, b.x2 as f64, b.y2 as f64),
    ];
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);
    Bounds::new(
        min_x.floor() as i32,
        min_y.floor() as i32,
        max_x.ceil() as i32,
        max_y.ceil() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(v: i32) -> i32 {
        v << 16
    }

    #[test]
    fn test_rotation_swaps_scanout_bounds() {
        let (device, is_transform) =
            DeviceTransform::compute(100, 50, 1920, 1080, Rotation::ROTATE_90, None);
        assert!(is_transform);
        let bounds = transform_bounds(&device.forward, &Bounds::new(0, 0, 1920, 1080));
        assert_eq!(bounds, Bounds::new(100, 50, 1180, 1970));

        // The crtc origin shows the bottom left corner of the mode
        let (mx, my) = apply(&device.inverse, 100.0, 50.0);
        assert!(mx.abs() < 1e-9);
        assert!((my - 1080.0).abs() < 1e-9);
    }

    #[test]
    fn test_plain_position_is_a_translation() {
        let (device, is_transform) =
            DeviceTransform::compute(1920, 0, 1280, 1024, Rotation::ROTATE_0, None);
        assert!(!is_transform);
        assert_eq!(device.matrix, FixedMatrix::translate(1920, 0));
        let bounds = transform_bounds(&device.forward, &Bounds::new(0, 0, 1280, 1024));
        assert_eq!(bounds, Bounds::new(1920, 0, 3200, 1024));
    }

    #[test]
    fn test_reflection_keeps_extent() {
        let (device, _) = DeviceTransform::compute(
            0,
            0,
            800,
            600,
            Rotation::ROTATE_0 | Rotation::REFLECT_X,
            None,
        );
        let bounds = transform_bounds(&device.forward, &Bounds::new(0, 0, 800, 600));
        assert_eq!(bounds, Bounds::new(0, 0, 800, 600));
    }

    #[test]
    fn test_client_scale_grows_bounds() {
        let mut m = FixedMatrix::IDENTITY;
        m.0[0][0] = fixed(2);
        m.0[1][1] = fixed(2);
        let client = ClientTransform::from_request(m, b"", &[]).unwrap();
        let (device, _) =
            DeviceTransform::compute(0, 0, 640, 480, Rotation::ROTATE_0, Some(&client));
        let bounds = transform_bounds(&device.forward, &Bounds::new(0, 0, 640, 480));
        assert_eq!(bounds, Bounds::new(0, 0, 1280, 960));
    }

    #[test]
    fn test_singular_matrix_is_rejected() {
        let m = FixedMatrix([[0; 3]; 3]);
        assert_eq!(
            ClientTransform::from_request(m, b"", &[]).unwrap_err(),
            RrError::Match(0)
        );
    }

    #[test]
    fn test_filter_validation() {
        let id = FixedMatrix::IDENTITY;
        assert_eq!(
            ClientTransform::from_request(id, b"lanczos", &[]).unwrap_err(),
            RrError::Name(0)
        );
        assert_eq!(
            ClientTransform::from_request(id, b"", &[fixed(1)]).unwrap_err(),
            RrError::Match(0)
        );

        let good = ClientTransform::from_request(id, b"good", &[]).unwrap();
        assert_eq!(good.filter, Some(Filter::Bilinear));

        let kernel = [fixed(3), fixed(1), 1, 2, 3];
        let conv = ClientTransform::from_request(id, b"convolution", &kernel).unwrap();
        assert_eq!((conv.width, conv.height), (3, 1));
        assert!(Filter::Convolution.validate(&[fixed(3), fixed(2), 1, 2, 3]).is_none());
        assert!(Filter::Convolution.validate(&[fixed(1) + 1, fixed(1), 1]).is_none());

        // 4 + (2 << 1) + (1 << 0) = 9 values
        let mut separable = vec![fixed(2), fixed(1), fixed(1), 0];
        separable.extend([0; 5]);
        assert_eq!(Filter::SeparableConvolution.validate(&separable), Some((2, 1)));
        separable.pop();
        assert!(Filter::SeparableConvolution.validate(&separable).is_none());
    }

    #[test]
    fn test_identity_transforms_equal_regardless_of_filter() {
        let plain = ClientTransform::identity();
        let filtered = ClientTransform::from_request(FixedMatrix::IDENTITY, b"nearest", &[]).unwrap();
        assert_eq!(plain, filtered);

        let mut m = FixedMatrix::IDENTITY;
        m.0[0][2] = fixed(10);
        let shifted = ClientTransform::from_request(m, b"", &[]).unwrap();
        assert_ne!(plain, shifted);
    }
}
