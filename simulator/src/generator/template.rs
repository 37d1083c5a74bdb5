use destripecore::PixelMap;
use ndarray::Array2;
use std::f64::consts::PI;

/// Builds a smooth synthetic sky with `nnz` Stokes components per pixel.
///
/// Intensity is a few slow sine waves over the pixel index; the
/// polarization components, when present, are a tenth of that amplitude.
pub fn sky_map(npix: usize, nnz: usize, amplitude: f64) -> PixelMap {
    let npix_f = npix.max(1) as f64;
    let data = Array2::from_shape_fn((npix, nnz), |(pixel, inz)| {
        let phase = 2.0 * PI * pixel as f64 / npix_f;
        match inz {
            0 => amplitude * ((3.0 * phase).sin() + 0.5 * (7.0 * phase).cos()),
            1 => 0.1 * amplitude * (5.0 * phase).cos(),
            _ => 0.1 * amplitude * (2.0 * phase).sin(),
        }
    });
    PixelMap::from_data(data)
}
