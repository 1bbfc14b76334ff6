// MIT License - Copyright (c) 2026 Peter Wright
// Device models

pub mod area;
pub mod output;
pub mod system;
pub mod zone;

pub use area::Area;
pub use output::Output;
pub use system::{SystemCode, SystemField, SystemStatusFlags};
pub use zone::{Zone, ZoneStatusFlags};
