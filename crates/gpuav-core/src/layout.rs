//! Rewrites set-layout arrays so the reserved slot always holds the
//! instrumentation layout, with the shared dummy layout padding the gap.

use ash::vk;
use smallvec::SmallVec;
use thiserror::Error;

#[derive(Error, Debug)]
#[error(
    "setLayoutCount ({set_layout_count}) conflicts with validation's descriptor set at slot \
     {reserved_slot}. This layout has too many descriptor sets to allow GPU shader \
     instrumentation to be set up for objects created with it, therefore no validation errors \
     will be reported for them at runtime."
)]
pub struct LayoutOverflow {
    pub set_layout_count: u32,
    pub reserved_slot: u32,
}

///Device-constant inputs of the adaptation: the reserved slot plus the two
/// layouts created at device init.
#[derive(Debug, Clone, Copy)]
pub struct LayoutAdapter {
    pub reserved_slot: u32,
    pub dummy_layout: vk::DescriptorSetLayout,
    pub instrumentation_layout: vk::DescriptorSetLayout,
}

impl LayoutAdapter {
    ///Extends `set_layouts` in place: caller's layouts stay at `[0, n)`, the
    /// dummy fills `[n, reserved_slot)` and the instrumentation layout lands
    /// at `reserved_slot`. Errors when the caller already reaches past the
    /// reserved slot, in which case the array is left untouched.
    pub fn adapt(
        &self,
        set_layouts: &mut SmallVec<[vk::DescriptorSetLayout; 8]>,
    ) -> Result<(), LayoutOverflow> {
        let original_count = set_layouts.len() as u32;
        if original_count > self.reserved_slot {
            return Err(LayoutOverflow {
                set_layout_count: original_count,
                reserved_slot: self.reserved_slot,
            });
        }

        set_layouts.reserve((self.reserved_slot + 1 - original_count) as usize);
        for _ in original_count..self.reserved_slot {
            set_layouts.push(self.dummy_layout);
        }
        set_layouts.push(self.instrumentation_layout);
        debug_assert_eq!(set_layouts.len() as u32, self.reserved_slot + 1);
        Ok(())
    }
}
