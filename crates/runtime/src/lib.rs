mod service;

pub use service::TutoringService;
