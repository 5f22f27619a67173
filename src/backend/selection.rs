// Physical device selection
//
// The first enumerated device that satisfies every requirement wins. There is
// no scoring: the same enumeration always yields the same choice.
//
// The predicate works on plain data gathered from the driver so it can be
// exercised without a GPU.

use std::collections::BTreeSet;
use std::ffi::CStr;
use std::fmt;

/// Queue capabilities of one queue family on a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Queue family indices needed by the renderer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan families in order, stopping as soon as both roles are filled.
    pub fn find(families: &[QueueFamilySupport]) -> Self {
        let mut indices = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.graphics && indices.graphics.is_none() {
                indices.graphics = Some(index);
            }
            if family.present && indices.present.is_none() {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }

        indices
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Both indices, once `is_complete` holds.
    pub fn resolved(&self) -> Option<ResolvedQueueFamilies> {
        Some(ResolvedQueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
        })
    }
}

/// Queue families of a device that passed selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedQueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl ResolvedQueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// One entry per distinct family, for logical device queue creation.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }
}

/// Everything the selection predicate needs to know about one device
#[derive(Debug, Clone)]
pub struct DeviceCandidate<H> {
    pub handle: H,
    pub name: String,
    pub queue_families: Vec<QueueFamilySupport>,
    pub extensions: Vec<String>,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
}

/// Why a candidate was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NoGraphicsQueue,
    NoPresentQueue,
    MissingExtensions(Vec<String>),
    InadequateSwapchain,
}

impl<H> DeviceCandidate<H> {
    /// Apply the four requirements in order; the first failure is reported.
    pub fn evaluate(&self, required_extensions: &[&CStr]) -> Result<ResolvedQueueFamilies, Rejection> {
        let indices = QueueFamilyIndices::find(&self.queue_families);
        if indices.graphics.is_none() {
            return Err(Rejection::NoGraphicsQueue);
        }
        let families = indices.resolved().ok_or(Rejection::NoPresentQueue)?;

        let missing = missing_extensions(required_extensions, &self.extensions);
        if !missing.is_empty() {
            return Err(Rejection::MissingExtensions(missing));
        }

        if self.surface_format_count == 0 || self.present_mode_count == 0 {
            return Err(Rejection::InadequateSwapchain);
        }

        Ok(families)
    }
}

/// Required extension names not present in `available`.
pub fn missing_extensions(required: &[&CStr], available: &[String]) -> Vec<String> {
    required
        .iter()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !available.iter().any(|a| a == name))
        .collect()
}

/// Keep the devices that could be described. A device whose driver queries
/// failed counts as unsuitable and selection moves on to the next one.
pub fn usable_candidates<H, E: fmt::Display>(
    described: impl IntoIterator<Item = Result<DeviceCandidate<H>, E>>,
) -> Vec<DeviceCandidate<H>> {
    described
        .into_iter()
        .filter_map(|candidate| match candidate {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                log::warn!("Skipping GPU: {:#}", e);
                None
            }
        })
        .collect()
}

/// Pick the first suitable device in enumeration order.
pub fn pick_first_suitable<H>(
    candidates: &[DeviceCandidate<H>],
    required_extensions: &[&CStr],
) -> Option<(usize, ResolvedQueueFamilies)> {
    candidates.iter().enumerate().find_map(|(i, candidate)| {
        match candidate.evaluate(required_extensions) {
            Ok(families) => Some((i, families)),
            Err(reason) => {
                log::info!("Skipping GPU '{}': {:?}", candidate.name, reason);
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWAPCHAIN: &CStr = c"VK_KHR_swapchain";

    fn family(graphics: bool, present: bool) -> QueueFamilySupport {
        QueueFamilySupport { graphics, present }
    }

    fn candidate(handle: u32, families: Vec<QueueFamilySupport>) -> DeviceCandidate<u32> {
        DeviceCandidate {
            handle,
            name: format!("gpu{handle}"),
            queue_families: families,
            extensions: vec!["VK_KHR_swapchain".to_string()],
            surface_format_count: 2,
            present_mode_count: 1,
        }
    }

    #[test]
    fn shared_family_is_deduplicated() {
        let indices = QueueFamilyIndices::find(&[family(false, false), family(true, true)]);
        let families = indices.resolved().unwrap();
        assert_eq!(families.graphics, 1);
        assert_eq!(families.present, 1);
        assert!(families.is_shared());
        assert_eq!(families.unique(), vec![1]);
    }

    #[test]
    fn split_families_get_one_queue_each() {
        let indices = QueueFamilyIndices::find(&[family(true, false), family(false, true)]);
        let families = indices.resolved().unwrap();
        assert!(!families.is_shared());
        assert_eq!(families.unique(), vec![0, 1]);
    }

    #[test]
    fn first_matching_family_wins() {
        let indices = QueueFamilyIndices::find(&[
            family(true, false),
            family(true, true),
            family(false, true),
        ]);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn rejections_name_the_failed_requirement() {
        let required = [SWAPCHAIN];

        let no_graphics = candidate(0, vec![family(false, true)]);
        assert_eq!(no_graphics.evaluate(&required), Err(Rejection::NoGraphicsQueue));

        let no_present = candidate(1, vec![family(true, false)]);
        assert_eq!(no_present.evaluate(&required), Err(Rejection::NoPresentQueue));

        let mut no_ext = candidate(2, vec![family(true, true)]);
        no_ext.extensions.clear();
        assert_eq!(
            no_ext.evaluate(&required),
            Err(Rejection::MissingExtensions(vec!["VK_KHR_swapchain".to_string()]))
        );

        let mut no_modes = candidate(3, vec![family(true, true)]);
        no_modes.present_mode_count = 0;
        assert_eq!(no_modes.evaluate(&required), Err(Rejection::InadequateSwapchain));

        let mut no_formats = candidate(4, vec![family(true, true)]);
        no_formats.surface_format_count = 0;
        assert_eq!(no_formats.evaluate(&required), Err(Rejection::InadequateSwapchain));
    }

    #[test]
    fn picks_first_suitable_without_ranking() {
        let mut unsuitable = candidate(10, vec![family(true, true)]);
        unsuitable.extensions.clear();

        let candidates = vec![
            unsuitable,
            candidate(11, vec![family(true, false), family(false, true)]),
            candidate(12, vec![family(true, true)]),
        ];

        let (index, families) = pick_first_suitable(&candidates, &[SWAPCHAIN]).unwrap();
        assert_eq!(candidates[index].handle, 11);
        assert_eq!(families.unique(), vec![0, 1]);
    }

    #[test]
    fn selection_is_deterministic() {
        let candidates: Vec<_> = (0..4)
            .map(|i| candidate(i, vec![family(i % 2 == 1, true)]))
            .collect();

        let first = pick_first_suitable(&candidates, &[SWAPCHAIN]);
        for _ in 0..10 {
            assert_eq!(pick_first_suitable(&candidates, &[SWAPCHAIN]), first);
        }
        assert_eq!(first.map(|(i, _)| candidates[i].handle), Some(1));
    }

    #[test]
    fn device_with_failed_queries_is_skipped() {
        let described = vec![
            Err("Failed to query surface formats of GPU 'gpu0'".to_string()),
            Ok(candidate(1, vec![family(true, true)])),
        ];

        let candidates = usable_candidates(described);
        assert_eq!(candidates.len(), 1);

        let (index, _) = pick_first_suitable(&candidates, &[SWAPCHAIN]).unwrap();
        assert_eq!(candidates[index].handle, 1);
    }

    #[test]
    fn no_suitable_device_yields_none() {
        let candidates = vec![candidate(0, vec![family(false, false)])];
        assert!(pick_first_suitable(&candidates, &[SWAPCHAIN]).is_none());
        assert!(pick_first_suitable::<u32>(&[], &[SWAPCHAIN]).is_none());
    }
}
