pub mod fast_map;
pub mod lat_map;
