#[test]
fn admin_key_is_256_random_bytes_base64_encoded() {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let token = typesense_operator::secret::generate_token();
    let decoded = STANDARD.decode(&token).expect("valid base64");
    assert_eq!(decoded.len(), 256);
    // 256 bytes encode to ceil(256 / 3) * 4 characters.
    assert_eq!(token.len(), 344);
}
