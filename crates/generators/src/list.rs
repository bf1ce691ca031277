use appset_core::{Error, ListGenerator, ParameterSet, Result};

/// One parameter set per element, in declared order.
pub fn generate(g: &ListGenerator) -> Result<Vec<ParameterSet>> {
    g.elements
        .iter()
        .enumerate()
        .map(|(i, el)| match el.as_object() {
            Some(obj) => Ok(ParameterSet::from_object(obj)),
            None => Err(Error::invalid(format!("list element {i} is not an object"))),
        })
        .collect()
}
