use crate::crd::{Component, RisingWaveSpec};

/// Where the replicas of a group live in the spec of a `RisingWave`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicasSlot {
    NodeGroup(usize),
    LegacyGroup(usize),
    GlobalReplicas,
}

/// Reads and writes the replicas of the groups of one component. Node groups are used as soon
/// as the component has any. Otherwise the legacy groups are addressed, and the default group
/// maps onto the global replicas.
pub struct ReplicasHelper<'a> {
    spec: &'a RisingWaveSpec,
    component: Component,
}

impl<'a> ReplicasHelper<'a> {
    pub fn new(spec: &'a RisingWaveSpec, component: Component) -> Self {
        Self { spec, component }
    }

    pub fn slot(&self, group: &str) -> Option<ReplicasSlot> {
        let component = self.spec.components.get(self.component);
        if !component.node_groups.is_empty() {
            return component
                .node_groups
                .iter()
                .position(|g| g.name == group)
                .map(ReplicasSlot::NodeGroup);
        }
        if let Some(i) = component.groups.iter().position(|g| g.name == group) {
            return Some(ReplicasSlot::LegacyGroup(i));
        }
        (group.is_empty() && self.spec.global.is_some()).then_some(ReplicasSlot::GlobalReplicas)
    }

    pub fn read(&self, group: &str) -> Option<i32> {
        let component = self.spec.components.get(self.component);
        Some(match self.slot(group)? {
            ReplicasSlot::NodeGroup(i) => component.node_groups[i].replicas,
            ReplicasSlot::LegacyGroup(i) => component.groups[i].replicas,
            ReplicasSlot::GlobalReplicas => self.spec.global_replicas(self.component),
        })
    }

    /// JSON field path of the replicas of `group`, as reported in admission errors.
    pub fn field_path(&self, group: &str) -> Option<String> {
        let c = self.component;
        Some(match self.slot(group)? {
            ReplicasSlot::NodeGroup(i) => format!("spec.components.{c}.nodeGroups[{i}].replicas"),
            ReplicasSlot::LegacyGroup(i) => format!("spec.components.{c}.groups[{i}].replicas"),
            ReplicasSlot::GlobalReplicas => format!("spec.global.replicas.{c}"),
        })
    }

    /// JSON pointer to the replicas of `group`, for patching the stored object.
    pub fn json_pointer(&self, group: &str) -> Option<String> {
        let c = self.component;
        Some(match self.slot(group)? {
            ReplicasSlot::NodeGroup(i) => format!("/spec/components/{c}/nodeGroups/{i}/replicas"),
            ReplicasSlot::LegacyGroup(i) => format!("/spec/components/{c}/groups/{i}/replicas"),
            ReplicasSlot::GlobalReplicas => format!("/spec/global/replicas/{c}"),
        })
    }

    /// Names of the groups of the component in the order they are declared.
    pub fn groups(&self) -> Vec<String> {
        self.spec
            .node_groups(self.component)
            .into_iter()
            .map(|g| g.name)
            .collect()
    }
}

/// Writes `replicas` into the slot of `group`. Returns true when the group exists and the value
/// changed.
pub fn write_replicas(
    spec: &mut RisingWaveSpec,
    component: Component,
    group: &str,
    replicas: i32,
) -> bool {
    let Some(slot) = ReplicasHelper::new(spec, component).slot(group) else {
        return false;
    };
    let target = match slot {
        ReplicasSlot::NodeGroup(i) => &mut spec.components.get_mut(component).node_groups[i].replicas,
        ReplicasSlot::LegacyGroup(i) => &mut spec.components.get_mut(component).groups[i].replicas,
        ReplicasSlot::GlobalReplicas => match spec.global.as_mut() {
            Some(global) => global.replicas.get_mut(component),
            None => return false,
        },
    };
    if *target == replicas {
        return false;
    }
    *target = replicas;
    true
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn spec(input: &str) -> RisingWaveSpec {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[test]
    fn test_node_groups() {
        let mut spec = spec(indoc! {"
            components:
              frontend:
                nodeGroups:
                  - name: ''
                    replicas: 3
                  - name: b
                    replicas: 1
                groups:
                  - name: b
                    replicas: 7
        "});

        let helper = ReplicasHelper::new(&spec, Component::Frontend);
        assert_eq!(helper.read(""), Some(3));
        assert_eq!(helper.read("b"), Some(1));
        assert_eq!(helper.read("c"), None);
        assert_eq!(
            helper.field_path("b").as_deref(),
            Some("spec.components.frontend.nodeGroups[1].replicas")
        );
        assert_eq!(
            helper.json_pointer("").as_deref(),
            Some("/spec/components/frontend/nodeGroups/0/replicas")
        );
        assert_eq!(helper.groups(), vec!["", "b"]);

        assert!(write_replicas(&mut spec, Component::Frontend, "b", 4));
        assert!(!write_replicas(&mut spec, Component::Frontend, "b", 4));
        assert!(!write_replicas(&mut spec, Component::Frontend, "c", 4));
        assert_eq!(spec.components.frontend.node_groups[1].replicas, 4);
        assert_eq!(spec.components.frontend.groups[0].replicas, 7);
    }

    #[test]
    fn test_legacy_groups() {
        let mut spec = spec(indoc! {"
            global:
              replicas:
                compute: 2
            components:
              compute:
                groups:
                  - name: large
                    replicas: 1
        "});

        let helper = ReplicasHelper::new(&spec, Component::Compute);
        assert_eq!(helper.read(""), Some(2));
        assert_eq!(helper.read("large"), Some(1));
        assert_eq!(helper.field_path("").as_deref(), Some("spec.global.replicas.compute"));
        assert_eq!(helper.json_pointer("").as_deref(), Some("/spec/global/replicas/compute"));
        assert_eq!(
            helper.field_path("large").as_deref(),
            Some("spec.components.compute.groups[0].replicas")
        );

        assert!(write_replicas(&mut spec, Component::Compute, "", 5));
        assert!(write_replicas(&mut spec, Component::Compute, "large", 0));
        assert_eq!(spec.global_replicas(Component::Compute), 5);
        assert_eq!(spec.components.compute.groups[0].replicas, 0);
    }
}
