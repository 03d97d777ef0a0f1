/// Instance catalog, desired workload shape and the fallback matrix
///
/// Priority is the single ordering source. The builder encodes the
/// documented precedence as priority bands:
///
/// ```text
/// tier 1  (0..100)     preferred classes, primary region
/// tier 2  (100..1000)  preferred classes, fallback regions (one region at a time)
/// tier 3  (1000..)     any other GPU class meeting the floor, every region
/// ```
use serde::{Deserialize, Serialize};
use std::fmt;

const TIER2_BASE: u32 = 100;
const TIER3_BASE: u32 = 1000;

/// Static facts about one instance class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceSpec {
    pub class: &'static str,
    pub vcpus: u32,
    pub memory_gib: u32,
    pub gpus: u32,
    pub gpu_memory_gib: u32,

    /// Approximate on-demand price (USD/hour)
    pub on_demand_price: f64,
}

pub const INSTANCE_CATALOG: &[InstanceSpec] = &[
    InstanceSpec { class: "g4dn.xlarge", vcpus: 4, memory_gib: 16, gpus: 1, gpu_memory_gib: 16, on_demand_price: 1.19 },
    InstanceSpec { class: "g4dn.2xlarge", vcpus: 8, memory_gib: 32, gpus: 1, gpu_memory_gib: 16, on_demand_price: 2.38 },
    InstanceSpec { class: "g5g.xlarge", vcpus: 4, memory_gib: 8, gpus: 1, gpu_memory_gib: 16, on_demand_price: 0.42 },
    InstanceSpec { class: "g5g.2xlarge", vcpus: 8, memory_gib: 16, gpus: 1, gpu_memory_gib: 16, on_demand_price: 0.56 },
    InstanceSpec { class: "g5.xlarge", vcpus: 4, memory_gib: 16, gpus: 1, gpu_memory_gib: 24, on_demand_price: 1.21 },
    InstanceSpec { class: "g5.2xlarge", vcpus: 8, memory_gib: 32, gpus: 1, gpu_memory_gib: 24, on_demand_price: 1.52 },
    InstanceSpec { class: "p3.2xlarge", vcpus: 8, memory_gib: 61, gpus: 1, gpu_memory_gib: 16, on_demand_price: 3.06 },
];

pub fn instance_spec(class: &str) -> Option<&'static InstanceSpec> {
    INSTANCE_CATALOG.iter().find(|spec| spec.class == class)
}

/// What the workload needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredShape {
    /// Instance classes to try first, in order of preference
    pub preferred_classes: Vec<String>,

    pub min_vcpus: u32,
    pub min_memory_gib: u32,

    /// Interruptible (spot) rather than guaranteed capacity
    pub interruptible: bool,

    /// Bid ceiling for interruptible capacity (USD/hour)
    pub max_spot_price: Option<f64>,

    /// Try equal-priority candidates in different regions concurrently
    pub diversified: bool,
}

impl Default for DesiredShape {
    fn default() -> Self {
        Self {
            preferred_classes: vec!["g4dn.xlarge".to_string(), "g5g.xlarge".to_string()],
            min_vcpus: 4,
            min_memory_gib: 8,
            interruptible: true,
            max_spot_price: Some(0.75),
            diversified: false,
        }
    }
}

impl DesiredShape {
    /// Whether a catalog class satisfies the floor. Classes missing from
    /// the catalog are trusted (the provider has the final word).
    pub fn admits(&self, class: &str) -> bool {
        match instance_spec(class) {
            Some(spec) => spec.vcpus >= self.min_vcpus && spec.memory_gib >= self.min_memory_gib,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallbackCandidate {
    pub instance_class: String,
    pub region: String,

    /// Lower is tried first
    pub priority: u32,

    /// May run concurrently with other diversified candidates of equal priority
    #[serde(default)]
    pub diversified: bool,
}

impl FallbackCandidate {
    pub fn new(instance_class: impl Into<String>, region: impl Into<String>, priority: u32) -> Self {
        Self {
            instance_class: instance_class.into(),
            region: region.into(),
            priority,
            diversified: false,
        }
    }

    pub fn diversified(mut self) -> Self {
        self.diversified = true;
        self
    }
}

impl fmt::Display for FallbackCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (p{})", self.instance_class, self.region, self.priority)
    }
}

/// Candidates in ascending priority
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackMatrix {
    candidates: Vec<FallbackCandidate>,
}

impl FallbackMatrix {
    /// Sorted by priority; list position only breaks ties
    pub fn new(mut candidates: Vec<FallbackCandidate>) -> Self {
        candidates.sort_by_key(|c| c.priority);
        Self { candidates }
    }

    /// Candidates ranked by list position (priority = index)
    pub fn ordered(pairs: &[(&str, &str)]) -> Self {
        Self::new(
            pairs
                .iter()
                .enumerate()
                .map(|(i, (class, region))| FallbackCandidate::new(*class, *region, i as u32))
                .collect(),
        )
    }

    /// Three-tier matrix for a shape
    pub fn build(shape: &DesiredShape, primary_region: &str, fallback_regions: &[String]) -> Self {
        let preferred: Vec<&str> = shape
            .preferred_classes
            .iter()
            .map(String::as_str)
            .filter(|class| shape.admits(class))
            .collect();

        let mut regions: Vec<&str> = Vec::with_capacity(fallback_regions.len());
        for region in fallback_regions {
            if region != primary_region && !regions.contains(&region.as_str()) {
                regions.push(region);
            }
        }

        let mut candidates = Vec::new();

        // Tier 1: same region, instance-class fallback
        for (i, class) in preferred.iter().enumerate() {
            candidates.push(FallbackCandidate::new(*class, primary_region, i as u32));
        }

        // Tier 2: cross-region, same classes. Diversified shapes try one
        // class in every fallback region at once.
        for (r, region) in regions.iter().enumerate() {
            for (i, class) in preferred.iter().enumerate() {
                let candidate = if shape.diversified {
                    FallbackCandidate::new(*class, *region, TIER2_BASE + i as u32).diversified()
                } else {
                    let priority = TIER2_BASE + (r * preferred.len() + i) as u32;
                    FallbackCandidate::new(*class, *region, priority)
                };
                candidates.push(candidate);
            }
        }

        // Tier 3: any other GPU class meeting the floor, cheapest first
        let mut others: Vec<&InstanceSpec> = INSTANCE_CATALOG
            .iter()
            .filter(|spec| !preferred.contains(&spec.class) && shape.admits(spec.class))
            .collect();
        others.sort_by(|a, b| a.on_demand_price.total_cmp(&b.on_demand_price));

        let all_regions: Vec<&str> = std::iter::once(primary_region)
            .chain(regions.iter().copied())
            .collect();
        let mut priority = TIER3_BASE;
        for spec in others {
            for region in &all_regions {
                candidates.push(FallbackCandidate::new(spec.class, *region, priority));
                priority += 1;
            }
        }

        Self::new(candidates)
    }

    pub fn candidates(&self) -> &[FallbackCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Consecutive runs of equal priority
    pub fn priority_groups(&self) -> Vec<&[FallbackCandidate]> {
        self.candidates
            .chunk_by(|a, b| a.priority == b.priority)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_sorts_by_priority_not_position() {
        let matrix = FallbackMatrix::new(vec![
            FallbackCandidate::new("g4dn.xlarge", "us-west-2", 5),
            FallbackCandidate::new("g4dn.xlarge", "us-east-1", 1),
            FallbackCandidate::new("g5g.xlarge", "us-east-1", 2),
        ]);
        let order: Vec<&str> = matrix.candidates().iter().map(|c| c.region.as_str()).collect();
        assert_eq!(order, vec!["us-east-1", "us-east-1", "us-west-2"]);
        assert_eq!(matrix.candidates()[1].instance_class, "g5g.xlarge");
    }

    #[test]
    fn test_build_exhausts_region_before_crossing() {
        let shape = DesiredShape::default();
        let matrix = FallbackMatrix::build(&shape, "us-east-1", &regions(&["us-west-2", "eu-west-1"]));
        let c = matrix.candidates();

        assert_eq!((c[0].instance_class.as_str(), c[0].region.as_str()), ("g4dn.xlarge", "us-east-1"));
        assert_eq!((c[1].instance_class.as_str(), c[1].region.as_str()), ("g5g.xlarge", "us-east-1"));
        assert_eq!((c[2].instance_class.as_str(), c[2].region.as_str()), ("g4dn.xlarge", "us-west-2"));
        assert_eq!((c[3].instance_class.as_str(), c[3].region.as_str()), ("g5g.xlarge", "us-west-2"));
        assert_eq!(c[4].region, "eu-west-1");

        // Tier 3 only after every preferred class in every region
        assert!(c[6].priority >= TIER3_BASE);
        assert!(c[6..].iter().all(|x| !shape.preferred_classes.contains(&x.instance_class)));
    }

    #[test]
    fn test_build_respects_floor() {
        let shape = DesiredShape {
            min_vcpus: 8,
            min_memory_gib: 32,
            preferred_classes: vec!["g4dn.xlarge".into(), "g5.2xlarge".into()],
            ..DesiredShape::default()
        };
        let matrix = FallbackMatrix::build(&shape, "us-east-1", &[]);
        let classes: Vec<&str> = matrix
            .candidates()
            .iter()
            .map(|c| c.instance_class.as_str())
            .collect();

        assert_eq!(classes[0], "g5.2xlarge");
        assert!(!classes.contains(&"g4dn.xlarge"));
        assert!(!classes.contains(&"g5g.2xlarge"));
        assert!(classes.contains(&"p3.2xlarge"));
    }

    #[test]
    fn test_diversified_groups_share_priority() {
        let shape = DesiredShape {
            diversified: true,
            ..DesiredShape::default()
        };
        let matrix = FallbackMatrix::build(&shape, "us-east-1", &regions(&["us-west-2", "eu-west-1"]));
        let groups = matrix.priority_groups();

        assert_eq!(groups[0].len(), 1);
        let tier2 = groups.iter().find(|g| g[0].priority == TIER2_BASE).unwrap();
        assert_eq!(tier2.len(), 2);
        assert!(tier2.iter().all(|c| c.diversified && c.instance_class == "g4dn.xlarge"));
    }
}
