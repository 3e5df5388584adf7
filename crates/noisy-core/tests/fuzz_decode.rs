use noisy_core::{
    message_type, MessageCookieReply, MessageInitiation, MessageResponse, TransportHeader,
    MESSAGE_INITIATION_SIZE, MESSAGE_TRANSPORT_SIZE,
};
use rand::{thread_rng, Rng};

#[test]
fn fuzz_decode_messages_never_panic() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..256);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = message_type(&data);
        let _ = MessageInitiation::decode(&data);
        let _ = MessageResponse::decode(&data);
        let _ = MessageCookieReply::decode(&data);
        let _ = TransportHeader::decode(&data);
    }
}

#[test]
fn fuzz_correctly_sized_handshake_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..1_000 {
        let mut data = vec![0u8; MESSAGE_INITIATION_SIZE];
        rng.fill(&mut data[..]);
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        let msg = MessageInitiation::decode(&data).expect("sized initiation decodes");
        assert_eq!(&msg.encode()[..], &data[..]);
    }
}

#[test]
fn random_mutation_of_transport_header_is_handled() {
    let mut rng = thread_rng();
    let mut packet = vec![0u8; MESSAGE_TRANSPORT_SIZE];
    packet[0..4].copy_from_slice(&4u32.to_le_bytes());

    for _ in 0..1_000 {
        let mut mutated = packet.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let _ = TransportHeader::decode(&mutated);
    }
}
