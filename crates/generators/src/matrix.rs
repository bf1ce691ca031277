use appset_core::{Error, ParameterSet, Result};

/// Cartesian product of the children's outputs. The first child varies
/// slowest; every tuple is deep-merged and a leaf produced by two children
/// fails with [`Error::AmbiguousParameterKey`].
pub fn combine(children: Vec<Vec<ParameterSet>>) -> Result<Vec<ParameterSet>> {
    if children.len() < 2 {
        return Err(Error::invalid(format!("matrix needs at least 2 child generators, got {}", children.len())));
    }
    let mut acc = vec![ParameterSet::new()];
    for child in &children {
        let mut next = Vec::with_capacity(acc.len() * child.len());
        for left in &acc {
            for right in child {
                next.push(left.merge_strict(right)?);
            }
        }
        acc = next;
    }
    Ok(acc)
}
