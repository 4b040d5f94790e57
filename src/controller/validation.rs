//! Cache spec validation. A spec that fails here is written to the status
//! as `Failed/CacheSpecValidationFailed` and is never auto-retried.

use crate::api::ImageCache;

pub(crate) fn validate_cache_spec(image_cache: &ImageCache) -> Result<(), String> {
    let cache_spec = &image_cache.spec.cache_spec;
    if cache_spec.is_empty() {
        return Err("cacheSpec must contain at least one entry".to_string());
    }
    for (i, entry) in cache_spec.iter().enumerate() {
        if entry.images.is_empty() {
            return Err(format!("cacheSpec[{i}] must list at least one image"));
        }
        let mut seen = std::collections::HashSet::new();
        for image in &entry.images {
            let name = image.name.trim();
            if name.is_empty() {
                return Err(format!("cacheSpec[{i}] contains an empty image reference"));
            }
            if name.chars().any(char::is_whitespace) {
                return Err(format!(
                    "cacheSpec[{i}] image reference {:?} contains whitespace",
                    image.name
                ));
            }
            if !seen.insert(&image.name) {
                return Err(format!(
                    "cacheSpec[{i}] lists image {:?} more than once",
                    image.name
                ));
            }
        }
    }
    Ok(())
}
