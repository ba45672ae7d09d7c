//! Final argument vector assembly.

/// Merge positional argument bindings with the manifest's static arguments.
///
/// Bound values come first, ordered by position, followed by the static
/// arguments in manifest order. Positions are validated to be contiguous before
/// this runs, so ordering by position is the same as placing each value at its
/// index.
pub fn merge_args<'a>(
    static_args: &[String],
    positional: impl IntoIterator<Item = (usize, &'a str)>,
) -> Vec<String> {
    let mut bound: Vec<(usize, &str)> = positional.into_iter().collect();
    bound.sort_by_key(|(position, _)| *position);

    let mut argv = Vec::with_capacity(bound.len() + static_args.len());
    argv.extend(bound.into_iter().map(|(_, value)| value.to_string()));
    argv.extend(static_args.iter().cloned());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_values_precede_static_args() {
        let static_args = vec!["--verbose".to_string()];
        let argv = merge_args(&static_args, [(1, "b"), (0, "a")]);
        assert_eq!(argv, vec!["a", "b", "--verbose"]);
    }

    #[test]
    fn static_args_alone_are_unchanged() {
        let static_args = vec!["suffix.rb".to_string(), "x".to_string()];
        assert_eq!(merge_args(&static_args, []), static_args);
    }
}
