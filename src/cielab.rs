use assume::assume;
use tables::{CUBE_ROOT_STEPS, CUBE_ROOT_TBL, LINEAR_TBL, RGB_TO_XYZ};

pub(crate) mod tables {
    use static_init::dynamic;
    /// Resolution of the `f(t)` lookup on `[0, 1]`.
    pub const CUBE_ROOT_STEPS: usize = 4096;
    /// sRGB to XYZ, rows already divided by the D65 white point.
    pub const RGB_TO_XYZ: [[f32; 3]; 3] = [
        [0.412453 / 0.950456, 0.357580 / 0.950456, 0.180423 / 0.950456],
        [0.212671, 0.715160, 0.072169],
        [0.019334 / 1.088754, 0.119193 / 1.088754, 0.950227 / 1.088754],
    ];
    #[dynamic(65535)]
    pub static LINEAR_TBL: [f32; 256] = core::array::from_fn(|i| srgb_to_linear(i as u8));
    #[dynamic(65535)]
    pub static CUBE_ROOT_TBL: [f32; CUBE_ROOT_STEPS + 1] =
        core::array::from_fn(|i| lab_nonlin(i as f32 / CUBE_ROOT_STEPS as f32));

    fn srgb_to_linear(a: u8) -> f32 {
        let v = a as f64 / 255.0;
        if v <= 0.04045 {
            return (v / 12.92) as f32;
        }
        ((v + 0.055) / 1.055).powf(2.4) as f32
    }

    pub(crate) fn lab_nonlin(t: f32) -> f32 {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    }
}

#[inline(always)]
fn cube_root_lookup(t: f32) -> f32 {
    let pos = t.clamp(0.0, 1.0) * CUBE_ROOT_STEPS as f32;
    let idx = pos as usize;
    assume!(unsafe: idx <= CUBE_ROOT_STEPS);
    if idx == CUBE_ROOT_STEPS {
        return unsafe { CUBE_ROOT_TBL[CUBE_ROOT_STEPS] };
    }
    let frac = pos - idx as f32;
    let (lo, hi) = unsafe { (CUBE_ROOT_TBL[idx], CUBE_ROOT_TBL[idx + 1]) };
    lo + (hi - lo) * frac
}

/// Convert an RGB24 pixel to Lab in 8-bit scaling: `L * 255 / 100`, `a + 128`, `b + 128`.
///
/// This matches the layout the appearance histograms bin against, with a few units of
/// quantization error from the interpolated cube-root table.
#[inline(always)]
pub fn rgb_to_lab_pixel(rgb: &[u8]) -> [u8; 3] {
    let r = unsafe { LINEAR_TBL[rgb[0] as usize] };
    let g = unsafe { LINEAR_TBL[rgb[1] as usize] };
    let b = unsafe { LINEAR_TBL[rgb[2] as usize] };
    let [mx, my, mz] = RGB_TO_XYZ;
    let x = mx[0] * r + mx[1] * g + mx[2] * b;
    let y = my[0] * r + my[1] * g + my[2] * b;
    let z = mz[0] * r + mz[1] * g + mz[2] * b;
    let fx = cube_root_lookup(x);
    let fy = cube_root_lookup(y);
    let fz = cube_root_lookup(z);
    let l = if y > 0.008856 { 116.0 * fy - 16.0 } else { 903.3 * y };
    let a = 500.0 * (fx - fy) + 128.0;
    let bb = 200.0 * (fy - fz) + 128.0;
    [
        (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8,
        a.round().clamp(0.0, 255.0) as u8,
        bb.round().clamp(0.0, 255.0) as u8,
    ]
}
