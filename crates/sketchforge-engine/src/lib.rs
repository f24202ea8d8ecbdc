pub mod captioner;
pub mod enhancer;
pub mod fetcher;
pub mod generator;
pub mod pipeline;
pub mod store;

mod transport;

#[cfg(test)]
mod test_support;

pub use captioner::{Captioner, HostedCaptioner};
pub use enhancer::{GeminiTextModel, PromptEnhancer, TextModel};
pub use fetcher::{HttpImageFetcher, ImageFetcher};
pub use generator::{GeminiImageModel, ImageGenerator, ImageModel};
pub use pipeline::Pipeline;
pub use store::{optimize_url, ArtifactStore, CloudinaryStore, DeliveryOptions};
