use std::path::Path;
use tch::{Device, Kind, Tensor};

// A simple wrapper around File::open adding details about the
// problematic file.
pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Maps decoded images from `[-1, 1]` to `u8` pixels on the cpu.
pub fn to_image_bytes(images: &Tensor) -> Tensor {
    let images = (images / 2. + 0.5).clamp(0., 1.).to_device(Device::Cpu);
    (images * 255.).round().to_kind(Kind::Uint8)
}

/// Picks a device per model, `cpu` lists the models forced on the cpu
/// (or `all`).
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}
