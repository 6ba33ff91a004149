mod op;
mod instruction;
mod builder;
mod decoder;

pub use op::{Op, SpecialSelector, base};
pub use instruction::{Constant, Instruction};
pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, decode_at};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).collect()
    }

    #[test]
    fn round_trip_short_forms() {
        let mut b = BytecodeBuilder::new();
        b.push_receiver_variable(3);
        b.push_temporary(15);
        b.push_literal_constant(31);
        b.push_literal_variable(2);
        b.pop_into_receiver_variable(7);
        b.pop_into_temporary(1);
        b.push_receiver();
        b.push_constant(Constant::MinusOne);
        b.send(4, 2);
        b.send_special(SpecialSelector::AtPut);
        b.pop();
        b.dup();
        b.return_constant(Constant::Nil);

        let bytes = b.into_bytes();
        assert_eq!(bytes.len(), 13);
        assert_eq!(decode_all(&bytes), vec![
            Instruction::PushReceiverVariable { index: 3 },
            Instruction::PushTemporary { index: 15 },
            Instruction::PushLiteralConstant { index: 31 },
            Instruction::PushLiteralVariable { index: 2 },
            Instruction::StoreReceiverVariable { index: 7, pop: true },
            Instruction::StoreTemporary { index: 1, pop: true },
            Instruction::PushReceiver,
            Instruction::PushConstant(Constant::MinusOne),
            Instruction::Send { literal: 4, argc: 2 },
            Instruction::SendSpecial(SpecialSelector::AtPut),
            Instruction::Pop,
            Instruction::Dup,
            Instruction::ReturnConstant(Constant::Nil),
        ]);
    }

    #[test]
    fn round_trip_extended_forms() {
        let mut b = BytecodeBuilder::new();
        b.push_receiver_variable(40);
        b.push_receiver_variable(200);
        b.push_temporary(20);
        b.push_literal_constant(100);
        b.store_receiver_variable(2);
        b.store_temporary(9);
        b.pop_into_literal_variable(5);
        b.store_literal_variable(70);
        b.send(20, 3);
        b.send(40, 1);
        b.send(200, 9);
        b.super_send(1, 1);
        b.super_send(90, 2);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::PushReceiverVariable { index: 40 },
            Instruction::PushReceiverVariable { index: 200 },
            Instruction::PushTemporary { index: 20 },
            Instruction::PushLiteralConstant { index: 100 },
            Instruction::StoreReceiverVariable { index: 2, pop: false },
            Instruction::StoreTemporary { index: 9, pop: false },
            Instruction::StoreLiteralVariable { index: 5, pop: true },
            Instruction::StoreLiteralVariable { index: 70, pop: false },
            Instruction::Send { literal: 20, argc: 3 },
            Instruction::Send { literal: 40, argc: 1 },
            Instruction::Send { literal: 200, argc: 9 },
            Instruction::SuperSend { literal: 1, argc: 1 },
            Instruction::SuperSend { literal: 90, argc: 2 },
        ]);
    }

    #[test]
    fn literal_send_bytes() {
        let mut b = BytecodeBuilder::new();
        b.send(0, 0);
        b.send(15, 1);
        b.send(1, 2);
        assert_eq!(b.into_bytes(), vec![208, 239, 241]);
    }

    #[test]
    fn forward_jump() {
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::True);
        let label = b.jump_if_false();
        b.push_constant(Constant::One);
        b.bind(label);
        b.return_top();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::PushConstant(Constant::True),
            Instruction::JumpIfFalse { offset: 1 },
            Instruction::PushConstant(Constant::One),
            Instruction::ReturnTop,
        ]);
    }

    #[test]
    fn long_forward_jump() {
        let mut b = BytecodeBuilder::new();
        let label = b.jump();
        for _ in 0..300 {
            b.pop();
        }
        b.bind(label);
        let bytes = b.into_bytes();
        assert_eq!(bytes[0], 165);
        assert_eq!(decode_at(&bytes, 0), Some((Instruction::Jump { offset: 300 }, 2)));
    }

    #[test]
    fn backward_jump() {
        let mut b = BytecodeBuilder::new();
        let loop_top = b.current_offset();
        b.push_temporary(0);
        b.pop();
        b.jump_back(loop_top);

        let bytes = b.into_bytes();
        assert_eq!(decode_all(&bytes), vec![
            Instruction::PushTemporary { index: 0 },
            Instruction::Pop,
            Instruction::Jump { offset: -4 },
        ]);
        assert!(decode_at(&bytes, 2).unwrap().0.is_backward_jump());
    }

    #[test]
    fn short_jumps() {
        assert_eq!(decode_all(&[144, 151, 152, 159]), vec![
            Instruction::Jump { offset: 1 },
            Instruction::Jump { offset: 8 },
            Instruction::JumpIfFalse { offset: 1 },
            Instruction::JumpIfFalse { offset: 8 },
        ]);
        assert_eq!(decode_all(&[171, 2]), vec![Instruction::JumpIfTrue { offset: 3 * 256 + 2 }]);
    }

    #[test]
    fn closure_body_size() {
        let mut b = BytecodeBuilder::new();
        b.push_temporary(0);
        let body = b.push_closure(1, 2);
        b.push_temporary(0);
        b.push_temporary(1);
        b.send_special(SpecialSelector::Add);
        b.block_return_top();
        b.bind(body);
        b.return_top();

        let bytes = b.into_bytes();
        assert_eq!(&bytes[1..5], &[143, 0x12, 0, 4]);
        assert_eq!(decode_at(&bytes, 1), Some((
            Instruction::PushClosure { copied: 1, args: 2, body: 4 },
            5,
        )));
    }

    #[test]
    fn remote_temps_and_arrays() {
        let mut b = BytecodeBuilder::new();
        b.push_new_array(3, false);
        b.push_new_array(2, true);
        b.push_remote_temp(1, 4);
        b.store_remote_temp(0, 4);
        b.pop_into_remote_temp(2, 5);
        b.push_this_context();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::PushNewArray { size: 3, pop: false },
            Instruction::PushNewArray { size: 2, pop: true },
            Instruction::PushRemoteTemp { index: 1, vector: 4 },
            Instruction::StoreRemoteTemp { index: 0, vector: 4, pop: false },
            Instruction::StoreRemoteTemp { index: 2, vector: 5, pop: true },
            Instruction::PushThisContext,
        ]);
    }

    #[test]
    fn unassigned_and_truncated() {
        assert_eq!(decode_all(&[126, 127, 139]), vec![
            Instruction::Unassigned(126),
            Instruction::Unassigned(127),
            Instruction::Unassigned(139),
        ]);
        // Extended store into a literal constant.
        assert_eq!(decode_all(&[129, 0x80]), vec![Instruction::Unassigned(129)]);
        // Operand bytes missing.
        assert_eq!(decode_at(&[132, 0], 0), None);
        assert_eq!(decode_at(&[143, 0, 0], 0), None);
        let mut d = BytecodeDecoder::new(&[112, 160]);
        assert_eq!(d.decode_next(), Some(Instruction::PushReceiver));
        assert_eq!(d.decode_next(), None);
        assert_eq!(d.offset(), 1);
    }

    #[test]
    fn every_byte_has_a_length() {
        for byte in 0..=255u8 {
            let len = Op::of(byte).length();
            assert!((1..=4).contains(&len), "byte {byte}");
        }
    }

    #[test]
    fn special_selectors() {
        assert_eq!(SpecialSelector::from_index(0), Some(SpecialSelector::Add));
        assert_eq!(SpecialSelector::from_index(31), Some(SpecialSelector::Y));
        assert_eq!(SpecialSelector::from_index(32), None);
        assert_eq!(SpecialSelector::AtPut.arg_count(), 2);
        assert_eq!(SpecialSelector::Class.arg_count(), 0);
        assert_eq!(SpecialSelector::BlockCopy.arg_count(), 1);
        assert_eq!(decode_all(&[176 + 22]), vec![Instruction::SendSpecial(SpecialSelector::Identical)]);
    }

    #[test]
    fn display_instructions() {
        assert_eq!(Instruction::Send { literal: 5, argc: 2 }.to_string(), "Send #5/2");
        assert_eq!(Instruction::Jump { offset: -7 }.to_string(), "Jump -7");
        assert_eq!(
            Instruction::StoreTemporary { index: 3, pop: true }.to_string(),
            "PopStoreTemp 3"
        );
        assert_eq!(Instruction::SendSpecial(SpecialSelector::AtPut).to_string(), "Send at:put:");
    }
}
