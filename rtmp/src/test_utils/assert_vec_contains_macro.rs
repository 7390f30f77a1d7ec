/// Panics unless at least one element of the vector matches the pattern.  An optional
/// `=> expression` is evaluated for every matching element with the pattern's bindings in scope.
macro_rules! assert_vec_contains {
    ($vector:expr, $pattern:pat $(if $cond:expr)? $(=> $success:expr)?) => {{
        let mut matched = 0usize;
        for item in $vector.iter() {
            #[allow(unreachable_patterns)]
            match item {
                $pattern $(if $cond)? => {
                    matched += 1;
                    $($success;)?
                }

                _ => (),
            }
        }

        if matched == 0 {
            panic!(
                "None of the {} elements matched '{}': {:?}",
                $vector.len(),
                stringify!($pattern $(if $cond)?),
                $vector
            );
        }
    }};
}
