//! Stenography mutators.
//!
//! Named pure transforms over prompt text, used as dynamic dataset
//! mutators: each mutator samples a fraction of a source dataset, obfuscates
//! the sampled prompts and prepends an instruction telling the target how to
//! read them.  (The name "stenography" is historical; the transforms are
//! textual obfuscations, not steganography.)

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{DatasetSource, PromptDataset};
use crate::httpspec::Modality;

pub const DEFAULT_SAMPLE_FRACTION: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    Rot5,
    Rot13,
    Base64,
    Mirror,
    RandomCase,
    WordScramble,
    NoiseInsertion,
    AsciiSubstitute,
    VowelRemoval,
    ZigzagCase,
}

pub const ALL_TRANSFORMS: &[Transform] = &[
    Transform::Rot5,
    Transform::Rot13,
    Transform::Base64,
    Transform::Mirror,
    Transform::RandomCase,
    Transform::WordScramble,
    Transform::NoiseInsertion,
    Transform::AsciiSubstitute,
    Transform::VowelRemoval,
    Transform::ZigzagCase,
];

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Rot5 => "rot5",
            Transform::Rot13 => "rot13",
            Transform::Base64 => "base64",
            Transform::Mirror => "mirror",
            Transform::RandomCase => "random-case",
            Transform::WordScramble => "word-scramble",
            Transform::NoiseInsertion => "noise-insertion",
            Transform::AsciiSubstitute => "ascii-substitute",
            Transform::VowelRemoval => "vowel-removal",
            Transform::ZigzagCase => "zigzag-case",
        }
    }

    pub fn apply(&self, text: &str, rng: &mut StdRng) -> String {
        match self {
            Transform::Rot5 => rot5(text),
            Transform::Rot13 => rot13(text),
            Transform::Base64 => STANDARD.encode(text.as_bytes()),
            Transform::Mirror => text.chars().rev().collect(),
            Transform::RandomCase => random_case(text, rng),
            Transform::WordScramble => word_scramble(text, rng),
            Transform::NoiseInsertion => noise_insertion(text, rng),
            Transform::AsciiSubstitute => ascii_substitute(text),
            Transform::VowelRemoval => vowel_removal(text),
            Transform::ZigzagCase => zigzag_case(text),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_TRANSFORMS
            .iter()
            .copied()
            .find(|t| t.name() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown stenography transform {s:?}"))
    }
}

fn rot5(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '0'..='9' => {
                let d = (c as u8 - b'0' + 5) % 10;
                (b'0' + d) as char
            }
            _ => c,
        })
        .collect()
}

fn rot13(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (b'a' + (c as u8 - b'a' + 13) % 26) as char,
            'A'..='Z' => (b'A' + (c as u8 - b'A' + 13) % 26) as char,
            _ => c,
        })
        .collect()
}

fn random_case(text: &str, rng: &mut StdRng) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphabetic() {
                if rng.gen_bool(0.5) {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            } else {
                c
            }
        })
        .collect()
}

// Shuffle the interior letters of each word, first and last kept in place.
fn word_scramble(text: &str, rng: &mut StdRng) -> String {
    text.split(' ')
        .map(|word| {
            let chars: Vec<char> = word.chars().collect();
            if chars.len() <= 3 {
                return word.to_string();
            }
            let mut middle: Vec<char> = chars[1..chars.len() - 1].to_vec();
            middle.shuffle(rng);
            let mut out = String::with_capacity(word.len());
            out.push(chars[0]);
            out.extend(middle);
            out.push(chars[chars.len() - 1]);
            out
        })
        .collect::<Vec<_>>()
        .join(" ")
}

const NOISE_CHARS: &[char] = &['*', '#', '~', '^', '|'];

fn noise_insertion(text: &str, rng: &mut StdRng) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        out.push(c);
        if rng.gen_bool(0.1) {
            out.push(NOISE_CHARS[rng.gen_range(0..NOISE_CHARS.len())]);
        }
    }
    out
}

fn ascii_substitute(text: &str) -> String {
    text.chars()
        .map(|c| match c.to_ascii_lowercase() {
            'a' => '4',
            'e' => '3',
            'i' => '1',
            'o' => '0',
            's' => '5',
            't' => '7',
            _ => c,
        })
        .collect()
}

fn vowel_removal(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u'))
        .collect()
}

fn zigzag_case(text: &str) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| {
            if i % 2 == 0 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

/// Derive a mutated dataset: sample `fraction` of the source prompts (at
/// least one), transform each and prepend the reading instruction.  Token
/// counts are re-approximated from the transformed text.
pub fn mutate(
    source: &PromptDataset,
    transform: Transform,
    fraction: f64,
    seed: Option<u64>,
) -> PromptDataset {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let count = ((source.prompts.len() as f64 * fraction).round() as usize)
        .clamp(1, source.prompts.len().max(1));
    let mut indices = rand::seq::index::sample(
        &mut rng,
        source.prompts.len(),
        count.min(source.prompts.len()),
    )
    .into_vec();
    indices.sort_unstable();

    let prompts: Vec<String> = indices
        .into_iter()
        .map(|i| {
            let obfuscated = transform.apply(&source.prompts[i], &mut rng);
            format!(
                "Follow the instructions in {}: {}",
                transform.name(),
                obfuscated
            )
        })
        .collect();

    let name = format!("stenography.{}({})", transform.name(), source.name);
    PromptDataset::new(name, prompts, Modality::Text, DatasetSource::Dynamic, true)
}
