use ember_crypto::sha256_hex;

/// Root of the binary hash tree over ordered transaction ids. An odd level
/// duplicates its last element; the empty list has the empty root.
pub fn merkle_root(ids: &[String]) -> String {
    if ids.is_empty() {
        return String::new();
    }
    let mut level: Vec<String> = ids.to_vec();
    while level.len() > 1 {
        pad_odd(&mut level);
        level = level
            .chunks(2)
            .map(|pair| combine(&pair[0], &pair[1]))
            .collect();
    }
    level.swap_remove(0)
}

/// Sibling hashes on the path from leaf `index` to the root, or `None` if
/// the index is out of range.
pub fn merkle_proof(ids: &[String], index: usize) -> Option<Vec<String>> {
    if index >= ids.len() {
        return None;
    }
    let mut proof = Vec::new();
    let mut level: Vec<String> = ids.to_vec();
    let mut pos = index;
    while level.len() > 1 {
        pad_odd(&mut level);
        proof.push(level[pos ^ 1].clone());
        level = level
            .chunks(2)
            .map(|pair| combine(&pair[0], &pair[1]))
            .collect();
        pos /= 2;
    }
    Some(proof)
}

/// Folds a proof back up to the root. Bit `k` of the leaf index decides the
/// concatenation order at step `k`: 0 puts the running hash on the left.
pub fn verify_inclusion(id: &str, root: &str, proof: &[String], index: usize) -> bool {
    let mut current = id.to_string();
    for (k, sibling) in proof.iter().enumerate() {
        current = if (index >> k) & 1 == 0 {
            combine(&current, sibling)
        } else {
            combine(sibling, &current)
        };
    }
    current == root
}

fn pad_odd(level: &mut Vec<String>) {
    if level.len() % 2 == 1 {
        let last = level[level.len() - 1].clone();
        level.push(last);
    }
}

// Hex characters are concatenated as ASCII bytes before hashing.
fn combine(left: &str, right: &str) -> String {
    sha256_hex(format!("{left}{right}").as_bytes())
}
