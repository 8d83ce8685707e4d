mod port;

pub use port::{MediaConf, MediaPort};
