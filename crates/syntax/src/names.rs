use crate::lexer::Token;
use rand::Rng;
use std::collections::HashSet;

const HEAD: [char; 2] = ['l', 'I'];
const TAIL: [char; 3] = ['l', 'I', '1'];

/// Fresh identifiers that cannot clash with any name already in the source.
#[derive(Debug, Default)]
pub struct Names {
    taken: HashSet<String>,
}

impl Names {
    pub fn from_tokens(tokens: &[(Token, std::ops::Range<usize>)]) -> Self {
        let taken = tokens
            .iter()
            .filter_map(|(token, _)| match token {
                Token::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        Self { taken }
    }

    pub fn fresh<R: Rng + ?Sized>(&mut self, rng: &mut R) -> String {
        loop {
            let len = rng.random_range(8..=14);
            let mut name = String::with_capacity(len);
            name.push(HEAD[rng.random_range(0..HEAD.len())]);
            for _ in 1..len {
                name.push(TAIL[rng.random_range(0..TAIL.len())]);
            }
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn fresh_names_are_unique_and_valid() {
        let tokens = lex("local lIlIlIlI = 1").unwrap();
        let mut names = Names::from_tokens(&tokens);
        let mut rng = StdRng::seed_from_u64(9);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let name = names.fresh(&mut rng);
            assert_ne!(name, "lIlIlIlI");
            assert!(name.starts_with(['l', 'I']));
            assert!(seen.insert(name));
        }
    }
}
