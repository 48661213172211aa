//! Component filename tests.

#[cfg(test)]
mod tests {
    use crate::sstable::{Component, ComponentDescriptor, ComponentNameError};

    fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor {
            keyspace: "ks1".to_string(),
            table: "events".to_string(),
            version: "me".to_string(),
            generation: 42,
            format: "big".to_string(),
        }
    }

    /// # Scenario
    /// Every component filename round-trips through parse.
    #[test]
    fn filenames_round_trip() {
        let d = descriptor();
        for component in [
            Component::Toc,
            Component::Data,
            Component::Index,
            Component::Filter,
            Component::Summary,
            Component::Statistics,
        ] {
            let name = d.filename(component);
            let (parsed, parsed_component) = ComponentDescriptor::parse(&name).unwrap();
            assert_eq!(parsed, d, "{name}");
            assert_eq!(parsed_component, component, "{name}");
        }
    }

    #[test]
    fn toc_filename_shape() {
        assert_eq!(descriptor().filename(Component::Toc), "ks1-events-me-42-big-TOC.txt");
    }

    /// # Scenario
    /// Filenames that do not split into six fields, carry a non-numeric
    /// generation, or end in an unknown suffix are rejected.
    #[test]
    fn malformed_filenames_are_rejected() {
        for name in ["", "x", "ks-t-me-42-big", "ks-t-me-xx-big-TOC.txt"] {
            assert!(
                matches!(
                    ComponentDescriptor::parse(name),
                    Err(ComponentNameError::Malformed(_))
                ),
                "{name}"
            );
        }
        assert!(matches!(
            ComponentDescriptor::parse("ks-t-me-42-big-Bogus.db"),
            Err(ComponentNameError::UnknownComponent(_))
        ));
    }
}
