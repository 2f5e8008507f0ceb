use anyhow::Result;

pub fn compute_aligned_size(size: u32, alignment: u32) -> u32 {
    (size + (alignment - 1)) & !(alignment - 1)
}

pub fn read_shader_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = std::io::Cursor::new(bytes);
    Ok(ash::util::read_spv(&mut cursor)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up_to_power_of_two() {
        assert_eq!(compute_aligned_size(32, 64), 64);
        assert_eq!(compute_aligned_size(64, 64), 64);
        assert_eq!(compute_aligned_size(65, 32), 96);
        assert_eq!(compute_aligned_size(0, 16), 0);
    }

    #[test]
    fn rejects_truncated_spirv() {
        assert!(read_shader_from_bytes(&[0x03, 0x02, 0x23]).is_err());
    }
}
