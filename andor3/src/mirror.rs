//! Device-driven cache synchronization.
//!
//! The driver invokes feature-changed callbacks on its own thread(s).
//! Rather than mutating session state from inside those callbacks, each
//! one only posts the feature name into a channel; a single consumer
//! thread applies the corresponding re-reads to the cached state under
//! the cache lock. Handlers make no assumption about the firing order of
//! different features.

use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use sdk3::encode_wide;

use crate::proxy::{Proxy, Warn};
use crate::Cache;

// Number of update events buffered between the driver callbacks and the
// consumer thread.
const N_CHANNEL_EVENTS: usize = 32;

/// Features whose cached values are kept synchronized by device
/// notifications.
pub(crate) const MIRRORED_FEATURES: &[&str] = &[
    "PixelEncoding",
    "BytesPerPixel",
    "AOILeft",
    "AOITop",
    "AOIWidth",
    "AOIHeight",
    "AOIStride",
    "FrameRate",
    "ImageSizeBytes",
    "SensorTemperature",
    "CameraAcquiring",
    "CameraPresent",
];

pub(crate) struct Mirror {
    thread: Option<std::thread::JoinHandle<()>>,
    registered: Vec<&'static str>,
}

impl Mirror {
    /// Register callbacks for every mirrored feature and spawn the
    /// consumer. Registration failure unwinds the registrations already
    /// made and fails session construction.
    pub fn start(proxy: Proxy, cache: Arc<Mutex<Cache>>) -> crate::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<String>(N_CHANNEL_EVENTS);
        let mut registered = Vec::with_capacity(MIRRORED_FEATURES.len());
        for &feature in MIRRORED_FEATURES {
            let tx = tx.clone();
            let result = proxy.driver.register_feature_callback(
                proxy.handle,
                &encode_wide(feature),
                Box::new(move |wide_name| {
                    match tx.try_send(sdk3::decode_wide(wide_name)) {
                        Ok(()) => {}
                        Err(mpsc::TrySendError::Full(_)) => {
                            warn!("feature update channel full; dropping a notification");
                        }
                        // Normal during shutdown, once the consumer is gone.
                        Err(mpsc::TrySendError::Disconnected(_)) => {}
                    }
                }),
            );
            if let Err(e) = result {
                for &done in &registered {
                    let _ = proxy
                        .driver
                        .unregister_feature_callback(proxy.handle, &encode_wide(done));
                }
                return Err(crate::Error::Device {
                    context: format!("register callback for '{}'", feature),
                    source: e,
                });
            }
            registered.push(feature);
        }
        drop(tx);

        let thread = std::thread::Builder::new()
            .name("andor3-mirror".to_string())
            .spawn(move || {
                // Runs until the last sender, owned by the driver-side
                // callbacks, is dropped at unregistration.
                while let Ok(feature) = rx.recv() {
                    apply_update(&proxy, &cache, &feature);
                }
            })
            .map_err(|_| crate::Error::InvalidState("could not spawn the mirror consumer thread"))?;

        Ok(Self {
            thread: Some(thread),
            registered,
        })
    }

    /// Unregister all callbacks and wait for the consumer to drain.
    pub fn stop(&mut self, proxy: &Proxy) {
        for &feature in &self.registered {
            if let Err(e) = proxy
                .driver
                .unregister_feature_callback(proxy.handle, &encode_wide(feature))
            {
                warn!("could not unregister callback for '{}': {} ({})", feature, e.msg, e.code);
            }
        }
        self.registered.clear();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("mirror consumer thread panicked");
            }
        }
    }
}

fn apply_update(proxy: &Proxy, cache: &Mutex<Cache>, feature: &str) {
    match feature {
        "PixelEncoding" => {
            if let Ok((_, wide)) = proxy.read_enum_wide("PixelEncoding") {
                let parsed = sdk3::decode_wide(&wide).parse().ok();
                let mut c = cache.lock();
                c.pixel_encoding_wide = wide;
                c.pixel_encoding = parsed;
            }
            if let Ok(bpp) = proxy.read_float("BytesPerPixel") {
                cache.lock().bytes_per_pixel = bpp;
            }
        }
        "BytesPerPixel" => {
            if let Ok(v) = proxy.read_float("BytesPerPixel") {
                cache.lock().bytes_per_pixel = v;
            }
        }
        "AOILeft" => {
            if let Ok(v) = proxy.read_integer("AOILeft") {
                cache.lock().aoi_left = v;
            }
        }
        "AOITop" => {
            if let Ok(v) = proxy.read_integer("AOITop") {
                cache.lock().aoi_top = v;
            }
        }
        "AOIWidth" => {
            if let Ok(v) = proxy.read_integer("AOIWidth") {
                cache.lock().aoi_width = v;
            }
        }
        "AOIHeight" => {
            if let Ok(v) = proxy.read_integer("AOIHeight") {
                cache.lock().aoi_height = v;
            }
        }
        "AOIStride" => {
            if let Ok(v) = proxy.read_integer("AOIStride") {
                cache.lock().aoi_stride = v;
            }
        }
        "FrameRate" => {
            if let Ok(v) = proxy.read_float("FrameRate") {
                cache.lock().frame_rate = v;
            }
            if let (Ok(min), Ok(max)) =
                (proxy.read_float_min("FrameRate"), proxy.read_float_max("FrameRate"))
            {
                let mut c = cache.lock();
                c.frame_rate_min = min;
                c.frame_rate_max = max;
            }
        }
        "ImageSizeBytes" => {
            if let Ok(v) = proxy.read_integer("ImageSizeBytes") {
                cache.lock().image_size = v;
            }
        }
        "SensorTemperature" => {
            if let Ok(v) = proxy.read_float("SensorTemperature") {
                cache.lock().sensor_temperature = v;
            }
        }
        "CameraAcquiring" => {
            if let Ok(v) = proxy.read_boolean("CameraAcquiring") {
                cache.lock().acquiring = v;
            }
        }
        "CameraPresent" => {
            match proxy.read_boolean_with("CameraPresent", Warn::Silent) {
                Ok(true) => cache.lock().present = true,
                Ok(false) | Err(_) => {
                    let mut c = cache.lock();
                    if c.present {
                        warn!("camera presence lost; reads are now best-effort and writes will fail");
                    }
                    c.present = false;
                }
            }
        }
        other => {
            debug!("unhandled feature notification: '{}'", other);
        }
    }
}
